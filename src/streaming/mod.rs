// Publish pipeline: engine abstraction, worker thread and bitrate telemetry

pub mod engine;
pub mod gst_engine;
pub mod reporter;
pub mod worker;

pub use engine::{PipelineEngine, PipelineError, PipelineEvent, PipelineSpec};
pub use gst_engine::GstEngine;
pub use reporter::{JsonStatsSink, LogStatsSink, StatsReporter, StatsSink, StatsSource};
pub use worker::{PipelineControl, PipelineWorker, StopOutcome, WorkerError, WorkerStatus};

use serde::Serialize;

/// Result of reading one stream's bitrate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamReading {
    /// Current bitrate in bits per second
    Bitrate { bitrate_bps: u64 },
    /// The engine has not set up this stream's session yet
    NoSession,
    /// The session exists but its statistics could not be read
    Failed { error: String },
}

/// Bitrate sample for one sub-stream (audio, video)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub stream: String,
    #[serde(flatten)]
    pub reading: StreamReading,
}

impl StreamStats {
    pub fn bitrate(stream: impl Into<String>, bitrate_bps: u64) -> Self {
        Self {
            stream: stream.into(),
            reading: StreamReading::Bitrate { bitrate_bps },
        }
    }

    pub fn no_session(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            reading: StreamReading::NoSession,
        }
    }

    pub fn failed(stream: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            reading: StreamReading::Failed {
                error: error.into(),
            },
        }
    }
}
