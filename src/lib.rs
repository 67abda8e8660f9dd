// Signalcast - capture signal supervisor and RTSP publisher
// Main library entry point

pub mod config;
pub mod devices;
pub mod gstreamer_init;
pub mod streaming;
pub mod supervisor;

use std::path::PathBuf;

use anyhow::Context;

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Run the supervisor until Ctrl-C / SIGTERM
pub fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging();

    // Set up plugin paths before any pipeline is built
    gstreamer_init::init_gstreamer_env();

    let config = config::Config::load_or_default(config_path.as_deref());

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        log::info!("Shutdown requested");
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to install signal handler")?;

    supervisor::run_supervisor(&config, shutdown_rx)
}

/// Print a one-shot signal/sink/GStreamer report as JSON
pub fn print_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging();

    let config = config::Config::load_or_default(config_path.as_deref());
    let report = supervisor::status_report(&config);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Write the effective configuration to `config_path` (or the default
/// location) so it can be edited. An existing file that fails to parse is
/// left alone.
pub fn write_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging();

    let path = config_path.unwrap_or_else(config::get_config_path);
    let config = if path.exists() {
        config::Config::load(&path)
            .with_context(|| format!("Refusing to overwrite {}", path.display()))?
    } else {
        config::Config::default()
    };
    config
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    log::info!("Wrote config to {}", path.display());
    Ok(())
}

/// Print the effective configuration as TOML
pub fn print_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging();

    let config = config::Config::load_or_default(config_path.as_deref());
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_config_fills_in_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signalcast").join("config.toml");

        write_config(Some(path.clone())).unwrap();
        assert_eq!(config::Config::load(&path).unwrap(), config::Config::default());

        std::fs::write(&path, "[sink]\nprocess_name = \"rtsp-simple-server\"\n").unwrap();
        write_config(Some(path.clone())).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("rtsp-simple-server"));
        assert!(written.contains("poll_interval_ms"));
    }

    #[test]
    fn write_config_keeps_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "timing = [not valid").unwrap();

        assert!(write_config(Some(path.clone())).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "timing = [not valid");
    }
}
