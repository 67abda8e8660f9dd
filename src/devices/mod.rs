// Capture signal and sink readiness probes

pub mod health;
pub mod timings;

pub use health::{ProcessSinkProbe, SinkProbe};
pub use timings::{parse_dv_timings, DvTimingsReader, SignalSource};

use serde::{Deserialize, Serialize};

/// Error type for external device/process queries
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Query failed: {0}")]
    Failure(String),

    #[error("Malformed query output: {0}")]
    Parse(String),
}

/// One reading of the capture device's input timings.
///
/// When `available` is false the numeric fields are zero and carry no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    pub available: bool,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl SignalReading {
    pub fn available(width: u32, height: u32, fps: f64) -> Self {
        Self {
            available: true,
            width,
            height,
            fps,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            width: 0,
            height: 0,
            fps: 0.0,
        }
    }

    /// `WxH`, or `NO INPUT` when there is no signal
    pub fn resolution_label(&self) -> String {
        if self.available {
            format!("{}x{}", self.width, self.height)
        } else {
            "NO INPUT".to_string()
        }
    }
}

impl std::fmt::Display for SignalReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.available {
            write!(f, "{}x{} @ {:.2}fps", self.width, self.height, self.fps)
        } else {
            write!(f, "NO INPUT")
        }
    }
}

/// Combined availability of signal and sink for one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Unavailable,
    Available,
}

impl InputState {
    pub fn classify(reading: &SignalReading, sink_ready: bool) -> Self {
        if reading.available && sink_ready {
            InputState::Available
        } else {
            InputState::Unavailable
        }
    }

    pub fn is_available(self) -> bool {
        self == InputState::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_requires_signal_and_sink() {
        let live = SignalReading::available(1920, 1080, 60.0);
        assert_eq!(InputState::classify(&live, true), InputState::Available);
        assert_eq!(InputState::classify(&live, false), InputState::Unavailable);
        assert_eq!(
            InputState::classify(&SignalReading::unavailable(), true),
            InputState::Unavailable
        );
    }

    #[test]
    fn display_labels() {
        assert_eq!(
            SignalReading::available(1280, 720, 59.94).to_string(),
            "1280x720 @ 59.94fps"
        );
        assert_eq!(SignalReading::unavailable().resolution_label(), "NO INPUT");
    }
}
