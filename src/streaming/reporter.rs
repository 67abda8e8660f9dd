// Bitrate telemetry - polls the running pipeline and forwards samples to a sink

use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use super::worker::WorkerError;
use super::{StreamReading, StreamStats};

/// Something that can be asked for the current per-stream bitrate
pub trait StatsSource: Send {
    fn poll_stats(&self) -> Result<Vec<StreamStats>, WorkerError>;
}

/// Destination for telemetry samples
pub trait StatsSink: Send {
    fn record(&mut self, stats: &StreamStats);
}

/// Writes samples through the logger
#[derive(Debug, Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn record(&mut self, stats: &StreamStats) {
        match &stats.reading {
            StreamReading::Bitrate { bitrate_bps } => {
                log::info!("Bitrate for {}: {}", stats.stream, bitrate_bps);
            }
            StreamReading::NoSession => {
                log::info!("Bitrate no {} (session not established)", stats.stream);
            }
            StreamReading::Failed { error } => {
                log::warn!("Error retrieving stats for {}: {}", stats.stream, error);
            }
        }
    }
}

#[derive(Serialize)]
struct TelemetrySample<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    stats: &'a StreamStats,
}

/// Writes one JSON object per sample, newline-delimited
pub struct JsonStatsSink<W: Write + Send> {
    writer: W,
}

impl JsonStatsSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonStatsSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> StatsSink for JsonStatsSink<W> {
    fn record(&mut self, stats: &StreamStats) {
        let sample = TelemetrySample {
            timestamp: Utc::now(),
            stats,
        };
        let result = serde_json::to_writer(&mut self.writer, &sample)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            log::warn!("Failed to write telemetry sample: {}", e);
        }
    }
}

/// Poll once and forward every stream's reading. Returns how many samples
/// were recorded.
pub fn report_once(source: &dyn StatsSource, sink: &mut dyn StatsSink) -> usize {
    match source.poll_stats() {
        Ok(samples) => {
            for stats in &samples {
                sink.record(stats);
            }
            samples.len()
        }
        Err(e) => {
            log::debug!("Telemetry poll skipped: {}", e);
            0
        }
    }
}

/// Background poller that is active only while a pipeline is streaming
pub struct StatsReporter {
    interval: Duration,
    sink: Arc<Mutex<Box<dyn StatsSink>>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StatsReporter {
    pub fn new(interval: Duration, sink: Box<dyn StatsSink>) -> Self {
        Self {
            interval,
            sink: Arc::new(Mutex::new(sink)),
            stop_tx: None,
            thread: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.thread.is_some()
    }

    /// Start polling `source`. An active poller is stopped first.
    pub fn start(&mut self, source: Box<dyn StatsSource>) {
        self.stop();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let sink = self.sink.clone();
        let interval = self.interval;

        let spawn_result = std::thread::Builder::new()
            .name("signalcast-stats".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    crossbeam_channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let mut sink = sink.lock();
                            report_once(source.as_ref(), sink.as_mut());
                        }
                    }
                }
            });

        match spawn_result {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
            }
            Err(e) => log::error!("Failed to spawn stats reporter: {}", e),
        }
    }

    /// Stop polling and wait for the poller thread to exit
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
