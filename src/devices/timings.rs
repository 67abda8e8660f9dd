// DV timings query - detects whether the capture input carries a live signal

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::config::DeviceConfig;

use super::{QueryError, SignalReading};

const WIDTH_LABEL: &str = "Active width:";
const HEIGHT_LABEL: &str = "Active height:";
const FPS_SUFFIX: &str = "frames per second";

const STDOUT: usize = 0;
const STDERR: usize = 1;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Source of capture signal readings
pub trait SignalSource: Send {
    fn read(&mut self) -> Result<SignalReading, QueryError>;
}

/// Reads the capture input by running an external timings query
/// (`v4l2-ctl --query-dv-timings` by default).
pub struct DvTimingsReader {
    program: String,
    args: Vec<String>,
    no_signal_marker: String,
    timeout: Duration,
}

impl DvTimingsReader {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            no_signal_marker: "failed".to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            program: config.query_program.clone(),
            args: config.query_args.clone(),
            no_signal_marker: config.no_signal_marker.clone(),
            timeout: Duration::from_millis(config.query_timeout_ms),
        }
    }

    /// Run the query and return stdout followed by stderr.
    ///
    /// Output and exit share one deadline. The child is killed if it has not
    /// closed both pipes and exited by then.
    fn run_query(&self) -> Result<String, QueryError> {
        let deadline = Instant::now() + self.timeout;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| QueryError::Failure(format!("Failed to spawn {}: {}", self.program, e)))?;

        // Each pipe gets its own reader so a full stderr cannot stall stdout
        let (output_tx, output_rx) = crossbeam_channel::bounded::<(usize, String)>(2);
        let readers = spawn_pipe_reader(STDOUT, child.stdout.take(), output_tx.clone())
            .and_then(|_| spawn_pipe_reader(STDERR, child.stderr.take(), output_tx));

        if let Err(e) = readers {
            kill_and_reap(&mut child);
            return Err(QueryError::Failure(format!("Failed to spawn query reader: {}", e)));
        }

        let mut parts = [String::new(), String::new()];
        for _ in 0..parts.len() {
            match output_rx.recv_deadline(deadline) {
                Ok((index, text)) => parts[index] = text,
                Err(RecvTimeoutError::Timeout) => {
                    kill_and_reap(&mut child);
                    return Err(QueryError::Timeout(self.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    kill_and_reap(&mut child);
                    return Err(QueryError::Failure("Query reader exited without output".into()));
                }
            }
        }

        // Pipes are closed but the child may still be running
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    kill_and_reap(&mut child);
                    return Err(QueryError::Timeout(self.timeout));
                }
                Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    log::debug!("Failed to reap {}: {}", self.program, e);
                    break;
                }
            }
        }

        let [stdout, stderr] = parts;
        Ok(stdout + &stderr)
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    index: usize,
    pipe: Option<R>,
    output_tx: Sender<(usize, String)>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("signalcast-query".into())
        .spawn(move || {
            let mut output = String::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_string(&mut output);
            }
            let _ = output_tx.send((index, output));
        })
        .map(|_| ())
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl SignalSource for DvTimingsReader {
    fn read(&mut self) -> Result<SignalReading, QueryError> {
        let output = self.run_query()?;
        parse_dv_timings(&output, &self.no_signal_marker)
    }
}

/// Parse DV timings query output.
///
/// Output containing `no_signal_marker` means no signal. Otherwise the active
/// width, active height and frames-per-second tokens must all be present.
pub fn parse_dv_timings(output: &str, no_signal_marker: &str) -> Result<SignalReading, QueryError> {
    if !no_signal_marker.is_empty() && output.contains(no_signal_marker) {
        return Ok(SignalReading::unavailable());
    }

    let width = labelled_value::<u32>(output, WIDTH_LABEL)?;
    let height = labelled_value::<u32>(output, HEIGHT_LABEL)?;
    let fps = frames_per_second(output)?;

    Ok(SignalReading::available(width, height, fps))
}

/// Integer following `label`, e.g. `Active width: 1920`
fn labelled_value<T: std::str::FromStr>(output: &str, label: &str) -> Result<T, QueryError> {
    let start = output
        .find(label)
        .ok_or_else(|| QueryError::Parse(format!("missing '{}'", label)))?
        + label.len();

    let token = output[start..]
        .split_whitespace()
        .next()
        .ok_or_else(|| QueryError::Parse(format!("no value after '{}'", label)))?;

    token
        .parse()
        .map_err(|_| QueryError::Parse(format!("invalid value '{}' after '{}'", token, label)))
}

/// Decimal rate immediately preceding `frames per second`.
///
/// v4l2-ctl prints `Frames per second: 60.00 (60.000 frames per second)`, so
/// leading punctuation on the token is ignored.
fn frames_per_second(output: &str) -> Result<f64, QueryError> {
    for (idx, _) in output.match_indices(FPS_SUFFIX) {
        let Some(token) = output[..idx].split_whitespace().next_back() else {
            continue;
        };
        let token = token.trim_start_matches(|c: char| !c.is_ascii_digit());
        if let Ok(fps) = token.parse::<f64>() {
            if fps.is_finite() && fps > 0.0 {
                return Ok(fps);
            }
        }
    }

    Err(QueryError::Parse(format!("missing '<rate> {}'", FPS_SUFFIX)))
}
