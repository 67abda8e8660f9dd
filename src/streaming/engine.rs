//! Media engine abstraction
//!
//! The worker never talks to GStreamer directly. It drives an engine through
//! build/activate/deactivate and asks it for per-stream statistics, so the
//! supervision logic can be exercised without a capture board.

use crate::config::{AudioSettings, Config, EncoderSettings};
use crate::devices::SignalReading;

use super::StreamStats;

/// Error type for pipeline engine operations
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PipelineError {
    #[error("Failed to build pipeline: {0}")]
    Build(String),

    #[error("Pipeline state change failed: {0}")]
    StateChange(String),

    #[error("Pipeline query failed: {0}")]
    Query(String),
}

/// Asynchronous notification from a running pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Error(String),
    Warning(String),
    EndOfStream,
}

/// Everything needed to build one publish pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub video_device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: String,
    pub encoder: EncoderSettings,
    /// None publishes video only
    pub audio: Option<AudioSettings>,
    pub rtsp_url: String,
    pub latency_ms: u32,
}

impl PipelineSpec {
    /// Build a spec from config, optionally adopting the detected input format
    pub fn from_config(config: &Config, reading: Option<&SignalReading>) -> Self {
        let pipeline = &config.pipeline;
        let mut spec = Self {
            video_device: pipeline.video_device.clone(),
            width: pipeline.width,
            height: pipeline.height,
            fps: pipeline.framerate as f64,
            pixel_format: pipeline.pixel_format.clone(),
            encoder: pipeline.encoder.clone(),
            audio: pipeline.audio.enabled.then(|| pipeline.audio.clone()),
            rtsp_url: config.sink.rtsp_url.clone(),
            latency_ms: config.sink.latency_ms,
        };

        if let Some(reading) = reading {
            spec = spec.with_signal(reading);
        }
        spec
    }

    /// Streams the pipeline publishes, in the order their sessions are created
    pub fn stream_names(&self) -> Vec<&'static str> {
        if self.audio.is_some() {
            vec!["audio", "video"]
        } else {
            vec!["video"]
        }
    }

    /// Replace the target format with a live reading. Unavailable readings
    /// leave the spec unchanged.
    pub fn with_signal(mut self, reading: &SignalReading) -> Self {
        if reading.available && reading.width > 0 && reading.height > 0 && reading.fps > 0.0 {
            self.width = reading.width;
            self.height = reading.height;
            self.fps = reading.fps;
        }
        self
    }
}

/// A media engine capable of running one publish pipeline per handle.
///
/// Handles are created, used and destroyed on the worker thread only.
pub trait PipelineEngine: Send + Sync + 'static {
    type Handle;

    fn build(&self, spec: &PipelineSpec) -> Result<Self::Handle, PipelineError>;

    fn activate(&self, handle: &Self::Handle) -> Result<(), PipelineError>;

    /// Tear the pipeline down. May block while the engine flushes.
    fn deactivate(&self, handle: &Self::Handle) -> Result<(), PipelineError>;

    /// Per-stream bitrate. Never fails as a whole: problems are reported per stream.
    fn query_stats(&self, handle: &Self::Handle) -> Vec<StreamStats>;

    /// Next pending event, without blocking
    fn poll_event(&self, handle: &Self::Handle) -> Option<PipelineEvent>;
}

/// Convert a frame rate to a `(numerator, denominator)` pair, mapping the
/// NTSC family (23.976, 29.97, 59.94) onto their exact x/1001 fractions.
pub fn fps_to_fraction(fps: f64) -> (i32, i32) {
    if !fps.is_finite() || fps <= 0.0 {
        return (30, 1);
    }

    let whole = fps.round();
    if (fps - whole).abs() < 0.005 {
        return (whole as i32, 1);
    }

    let ntsc = (fps * 1001.0 / 1000.0).round();
    if (ntsc * 1000.0 / 1001.0 - fps).abs() < 0.005 {
        return ((ntsc * 1000.0) as i32, 1001);
    }

    ((fps * 1000.0).round() as i32, 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_fractions() {
        assert_eq!(fps_to_fraction(60.0), (60, 1));
        assert_eq!(fps_to_fraction(29.97), (30000, 1001));
        assert_eq!(fps_to_fraction(59.94), (60000, 1001));
        assert_eq!(fps_to_fraction(23.976), (24000, 1001));
        assert_eq!(fps_to_fraction(12.5), (12500, 1000));
        assert_eq!(fps_to_fraction(0.0), (30, 1));
    }

    #[test]
    fn spec_uses_fixed_format_unless_following_signal() {
        let config = Config::default();
        let reading = SignalReading::available(1280, 720, 50.0);

        let fixed = PipelineSpec::from_config(&config, None);
        assert_eq!((fixed.width, fixed.height, fixed.fps), (1920, 1080, 60.0));
        assert_eq!(fixed.rtsp_url, "rtsp://127.0.0.1:8554/test");
        assert!(fixed.audio.is_some());

        let follow = PipelineSpec::from_config(&config, Some(&reading));
        assert_eq!((follow.width, follow.height, follow.fps), (1280, 720, 50.0));

        let unchanged = fixed.clone().with_signal(&SignalReading::unavailable());
        assert_eq!(unchanged, fixed);
    }

    #[test]
    fn audio_can_be_disabled() {
        let mut config = Config::default();
        assert_eq!(PipelineSpec::from_config(&config, None).stream_names(), ["audio", "video"]);

        config.pipeline.audio.enabled = false;
        let spec = PipelineSpec::from_config(&config, None);
        assert!(spec.audio.is_none());
        assert_eq!(spec.stream_names(), ["video"]);
    }
}
