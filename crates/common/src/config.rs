//! Application and run configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FramecastError, FramecastResult};

/// Global application configuration, loaded from the user config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Defaults applied to every render run.
    pub render: RenderDefaults,

    /// Rendering-engine driver process.
    pub driver: DriverConfig,

    /// Streaming encoder process.
    pub encoder: EncoderConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default render parameters that are not tied to a particular document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderDefaults {
    /// Pool size. `None` means one session per host CPU.
    pub parallelism: Option<usize>,

    /// Device pixel ratio passed to the engine.
    pub device_scale_factor: f64,

    /// Render with a transparent page background.
    pub transparent_background: bool,

    /// Readiness polling for movie metadata.
    pub readiness: ReadinessPolicy,
}

/// How long and how often a session polls the document for its ready signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

/// External process that implements the rendering-engine contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Program to spawn (looked up on PATH).
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,
}

/// Streaming encoder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder program (looked up on PATH).
    pub program: String,

    /// Constant rate factor for the opaque H.264 preset.
    pub crf: u32,

    /// x264 speed preset for the opaque preset.
    pub preset: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "framecast_pool=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,
}

/// Complete parameters of one render run.
///
/// Built once (from CLI flags layered over [`AppConfig`]) and handed by
/// value to the pipeline.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Document to render.
    pub url: String,

    /// Encode the frames into this video file.
    pub output_video_path: Option<PathBuf>,

    /// Write each frame as a numbered PNG into this directory.
    pub png_output_dir: Option<PathBuf>,

    /// Maximum number of live rendering sessions.
    pub parallelism: usize,

    /// First frame to render (inclusive). Defaults to 0.
    pub start_frame: Option<u64>,

    /// Frame to stop at (exclusive). Defaults to the movie's frame count.
    pub end_frame: Option<u64>,

    pub transparent_background: bool,

    pub device_scale_factor: f64,

    /// Frame tasks allowed in flight ahead of the next one to deliver.
    pub queue_depth: usize,

    pub readiness: ReadinessPolicy,

    pub encoder: EncoderConfig,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            parallelism: None,
            device_scale_factor: 1.0,
            transparent_background: false,
            readiness: ReadinessPolicy::default(),
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

impl ReadinessPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Number of probes issued before giving up (at least one).
    pub fn max_polls(&self) -> u64 {
        if self.poll_interval_ms == 0 {
            return 1;
        }
        (self.timeout_ms / self.poll_interval_ms).max(1)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            program: "framecast-driver".to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            crf: 18,
            preset: "medium".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RenderConfig {
    /// A run of `url` using the application defaults.
    pub fn new(url: impl Into<String>, app: &AppConfig) -> Self {
        let parallelism = app
            .render
            .parallelism
            .unwrap_or_else(default_parallelism)
            .max(1);
        Self {
            url: url.into(),
            output_video_path: None,
            png_output_dir: None,
            parallelism,
            start_frame: None,
            end_frame: None,
            transparent_background: app.render.transparent_background,
            device_scale_factor: app.render.device_scale_factor,
            queue_depth: parallelism * 2,
            readiness: app.render.readiness,
            encoder: app.encoder.clone(),
        }
    }

    /// Check the parameters before any session is launched. Output
    /// presence is checked by the pipeline, which may carry extra sinks.
    pub fn validate(&self) -> FramecastResult<()> {
        if self.url.trim().is_empty() {
            return Err(FramecastError::config("url must not be empty"));
        }
        if self.parallelism == 0 {
            return Err(FramecastError::config("parallelism must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(FramecastError::config("queue depth must be at least 1"));
        }
        if !(self.device_scale_factor.is_finite() && self.device_scale_factor > 0.0) {
            return Err(FramecastError::config(format!(
                "device scale factor must be positive, got {}",
                self.device_scale_factor
            )));
        }
        if let (Some(start), Some(end)) = (self.start_frame, self.end_frame) {
            if end < start {
                return Err(FramecastError::config(format!(
                    "end frame {end} is before start frame {start}"
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }
}

/// One session per available CPU.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("framecast").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> RenderConfig {
        let mut config = RenderConfig::new("http://localhost:8080/movie", &AppConfig::default());
        config.png_output_dir = Some(PathBuf::from("frames"));
        config
    }

    #[test]
    fn defaults_follow_host_cpu_count() {
        let config = run_config();
        assert_eq!(config.parallelism, default_parallelism());
        assert_eq!(config.queue_depth, config.parallelism * 2);
        assert_eq!(config.device_scale_factor, 1.0);
        assert!(!config.transparent_background);
        assert_eq!(config.readiness.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.readiness.timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn readiness_policy_counts_polls() {
        assert_eq!(ReadinessPolicy::default().max_polls(), 10);
        let tight = ReadinessPolicy {
            poll_interval_ms: 0,
            timeout_ms: 50,
        };
        assert_eq!(tight.max_polls(), 1);
        let short = ReadinessPolicy {
            poll_interval_ms: 100,
            timeout_ms: 10,
        };
        assert_eq!(short.max_polls(), 1);
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut config = run_config();
        config.start_frame = Some(10);
        config.end_frame = Some(4);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("before start frame"));
    }

    #[test]
    fn validate_rejects_empty_url() {
        let mut config = run_config();
        config.url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_scale_and_parallelism() {
        let mut config = run_config();
        config.device_scale_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = run_config();
        config.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"render":{"parallelism":3},"encoder":{"crf":23}}"#).unwrap();
        assert_eq!(config.render.parallelism, Some(3));
        assert_eq!(config.render.device_scale_factor, 1.0);
        assert_eq!(config.encoder.crf, 23);
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.logging.level, "info");

        let run = RenderConfig::new("http://x", &config);
        assert_eq!(run.parallelism, 3);
        assert_eq!(run.queue_depth, 6);
    }
}
