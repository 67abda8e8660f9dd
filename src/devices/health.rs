// Sink readiness - checks that the streaming server process is running

use std::ffi::OsString;

use parking_lot::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Reports whether the downstream streaming server can accept a publish
pub trait SinkProbe: Send {
    fn is_sink_ready(&self) -> bool;
}

/// Scans the process table for the sink service (mediamtx by default).
///
/// A process matches when its name or its joined command line contains the
/// configured name, so `./mediamtx config.yml` and interpreter-launched
/// services are both found. The probing process itself is skipped, since its
/// own command line may mention the sink (`--config /etc/mediamtx/...`).
/// Thread entries are skipped too: on Linux every thread shows up with its
/// owner's command line.
pub struct ProcessSinkProbe {
    process_name: String,
    system: Mutex<System>,
}

impl ProcessSinkProbe {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            system: Mutex::new(System::new()),
        }
    }
}

impl SinkProbe for ProcessSinkProbe {
    fn is_sink_ready(&self) -> bool {
        if self.process_name.is_empty() {
            return false;
        }

        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let own_pid = sysinfo::get_current_pid().ok();
        system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                Some(**pid) != own_pid && process.thread_kind().is_none()
            })
            .any(|(_, process)| {
                process_matches(&process.name().to_string_lossy(), process.cmd(), &self.process_name)
            })
    }
}

fn process_matches(name: &str, cmd: &[OsString], needle: &str) -> bool {
    if name.contains(needle) {
        return true;
    }

    let cmdline = cmd
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    cmdline.contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn matches_by_name_or_command_line() {
        assert!(process_matches("mediamtx", &[], "mediamtx"));
        assert!(process_matches(
            "sh",
            &args(&["/opt/mediamtx/mediamtx", "/etc/mediamtx.yml"]),
            "mediamtx"
        ));
        assert!(!process_matches("nginx", &args(&["nginx", "-g", "daemon off;"]), "mediamtx"));
    }

    #[cfg(unix)]
    #[test]
    fn finds_running_process_by_command_line() {
        let mut child = std::process::Command::new("sleep")
            .arg("7.25")
            .spawn()
            .unwrap();

        let ready = ProcessSinkProbe::new("sleep 7.25").is_sink_ready();
        let _ = child.kill();
        let _ = child.wait();
        assert!(ready);
    }

    #[test]
    fn ignores_own_process() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().to_string();
        assert!(!ProcessSinkProbe::new(name).is_sink_ready());
    }

    #[test]
    fn ignores_own_threads() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let threads: Vec<_> = (0..3)
            .map(|i| {
                let release_rx = release_rx.clone();
                std::thread::Builder::new()
                    .name(format!("signalcast-idle-{}", i))
                    .spawn(move || {
                        let _ = release_rx.recv();
                    })
                    .unwrap()
            })
            .collect();

        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().to_string();
        let ready = ProcessSinkProbe::new(name).is_sink_ready();

        drop(release_tx);
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(!ready);
    }

    #[test]
    fn empty_name_is_never_ready() {
        assert!(!ProcessSinkProbe::new("").is_sink_ready());
    }
}
