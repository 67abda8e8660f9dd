// Configuration management for Signalcast

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for loading and saving configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Capture device timing query
    #[serde(default)]
    pub device: DeviceConfig,

    /// Downstream streaming server
    #[serde(default)]
    pub sink: SinkConfig,

    /// Publish pipeline parameters
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Control loop timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Bitrate telemetry
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Program that prints the current DV timings
    pub query_program: String,
    pub query_args: Vec<String>,
    /// Substring in the query output meaning "no signal"
    pub no_signal_marker: String,
    /// Hung queries are killed after this long
    pub query_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            query_program: "v4l2-ctl".to_string(),
            query_args: vec![
                "-d".to_string(),
                "/dev/v4l-subdev3".to_string(),
                "--query-dv-timings".to_string(),
            ],
            no_signal_marker: "failed".to_string(),
            query_timeout_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    /// Name (or command line fragment) of the streaming server process
    pub process_name: String,
    /// RTSP publish endpoint
    pub rtsp_url: String,
    /// rtspclientsink latency in milliseconds
    pub latency_ms: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            process_name: "mediamtx".to_string(),
            rtsp_url: "rtsp://127.0.0.1:8554/test".to_string(),
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// v4l2src device node. None lets v4l2src pick its default.
    pub video_device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub pixel_format: String,
    /// Use the detected signal resolution and frame rate instead of the
    /// fixed values above
    pub follow_signal: bool,
    pub encoder: EncoderSettings,
    pub audio: AudioSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_device: None,
            width: 1920,
            height: 1080,
            framerate: 60,
            pixel_format: "NV12".to_string(),
            follow_signal: false,
            encoder: EncoderSettings::default(),
            audio: AudioSettings::default(),
        }
    }
}

/// Video encoder element and its rate-control properties.
///
/// Values are strings deserialized into each property's declared type, so
/// ints and enum nicks both work. Unknown properties or unparseable values
/// fail the pipeline build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderSettings {
    pub element: String,
    pub parser: String,
    pub properties: BTreeMap<String, String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        let properties = [
            ("qp-init", "50"),
            ("qp-max", "51"),
            ("qp-min", "30"),
            ("rc-mode", "0"),
            ("gop", "60"),
            ("bps-max", "3000000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            element: "mpph265enc".to_string(),
            parser: "h265parse".to_string(),
            properties,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    pub enabled: bool,
    /// ALSA device for alsasrc
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// opusenc bitrate in bits per second
    pub opus_bitrate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "hw:1".to_string(),
            sample_rate: 48000,
            channels: 2,
            opus_bitrate: 320_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between signal/readiness polls
    pub poll_interval_ms: u64,
    /// How long a graceful pipeline stop may take before the worker is abandoned
    pub stop_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            stop_grace_ms: 3000,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    /// Human-readable lines through the logger
    #[default]
    Log,
    /// One JSON object per sample on stdout
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    /// How long a single stats request may wait on the pipeline worker
    pub query_timeout_ms: u64,
    pub format: TelemetryFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            query_timeout_ms: 500,
            format: TelemetryFormat::Log,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Config {
    /// Load config from `path` (or the default location) or return default
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(get_config_path);

        if !config_path.exists() {
            log::info!(
                "No config at {}, using defaults",
                config_path.display()
            );
            return Self::default();
        }

        match Self::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load config {}: {}", config_path.display(), e);
                Self::default()
            }
        }
    }

    /// Load config from a file, failing on IO or parse errors
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_toml()?)?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Get the default config file path
pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("signalcast")
        .join("config.toml")
}
