//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the pipeline, external tools, transcoding, analysis and
//! storage. Every section defaults sensibly so a completely empty `{}` file is
//! valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

/// Hardware acceleration methods understood by the transcoder.
pub const HW_ACCEL_METHODS: &[&str] = &["auto", "none", "videotoolbox", "nvenc", "vaapi", "qsv"];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub tools: ToolsConfig,
    pub transcode: TranscodeConfig,
    pub analysis: AnalysisConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist. A file that exists but does
    /// not parse is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Validation(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))),
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.workers == 0 {
            warnings.push("pipeline.workers is 0; one worker will be used".into());
        }

        for (tag, capacity) in &self.pipeline.concurrency {
            if *capacity == 0 {
                warnings.push(format!(
                    "pipeline.concurrency.{tag} is 0; capacities must be at least 1"
                ));
            }
        }

        let retry = &self.pipeline.retry;
        if retry.base_delay_ms > retry.max_delay_ms {
            warnings.push(format!(
                "pipeline.retry.base_delay_ms ({}) exceeds max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            ));
        }

        if let Some(ref hw) = self.transcode.hw_accel {
            if !HW_ACCEL_METHODS.contains(&hw.as_str()) {
                warnings.push(format!(
                    "transcode.hw_accel '{}' is not a recognized method (valid: {})",
                    hw,
                    HW_ACCEL_METHODS.join(", ")
                ));
            }
        }

        if self.transcode.fps <= 0.0 {
            warnings.push("transcode.fps must be positive".into());
        }

        if self.transcode.width % 2 != 0 || self.transcode.height % 2 != 0 {
            warnings.push(format!(
                "transcode dimensions {}x{} are not even; most encoders will reject them",
                self.transcode.width, self.transcode.height
            ));
        }

        if self.analysis.endpoint.is_none() && self.pipeline.step_enabled("analyze") != Some(false) {
            warnings.push("analysis.endpoint is not set; the analyze step will be disabled".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Worker pool, concurrency ceilings, retry policy and per-step overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of files processed concurrently.
    pub workers: usize,
    /// Concurrency tag -> maximum simultaneous step executions.
    pub concurrency: BTreeMap<String, usize>,
    pub retry: RetryConfig,
    /// Step name -> override of the built-in definition.
    pub steps: BTreeMap<String, StepOverride>,
    /// Directory for compressed analysis artifacts.
    pub work_dir: PathBuf,
    /// Keep compressed artifacts after a run instead of deleting them.
    pub keep_artifacts: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            concurrency: default_concurrency(),
            retry: RetryConfig::default(),
            steps: BTreeMap::new(),
            work_dir: std::env::temp_dir().join("mediaflow"),
            keep_artifacts: false,
        }
    }
}

impl PipelineConfig {
    /// The `enabled` override for a step, if one is configured.
    pub fn step_enabled(&self, step: &str) -> Option<bool> {
        self.steps.get(step).and_then(|o| o.enabled)
    }
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_concurrency() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("transcode".to_string(), 2),
        ("analysis".to_string(), 10),
        ("probe".to_string(), 4),
        ("storage".to_string(), 2),
    ])
}

/// Retry policy for transient-retryable steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Per-step override of the built-in step table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOverride {
    pub enabled: Option<bool>,
    pub critical: Option<bool>,
    pub timeout_secs: Option<u64>,
}

impl StepOverride {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Tools / transcode / analysis / storage
// ---------------------------------------------------------------------------

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Target shape of the reduced copy uploaded for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub width: u32,
    pub height: u32,
    /// Target sampling rate in frames per second.
    pub fps: f64,
    /// Target video bitrate in bits per second.
    pub video_bitrate: u64,
    /// Target audio bitrate in bits per second.
    pub audio_bitrate: u64,
    pub audio_channels: u16,
    /// Hardware acceleration method (auto, none, videotoolbox, nvenc, vaapi,
    /// qsv). `None` and "auto" both probe the platform once per process.
    pub hw_accel: Option<String>,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 2.0,
            video_bitrate: 400_000,
            audio_bitrate: 64_000,
            audio_channels: 1,
            hw_accel: None,
        }
    }
}

/// Generative-AI analysis service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "media-analysis-v1".into(),
            request_timeout_secs: 120,
        }
    }
}

/// Storage backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mediaflow.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.pipeline.concurrency.get("transcode"), Some(&2));
        assert_eq!(cfg.pipeline.concurrency.get("analysis"), Some(&10));
        assert_eq!(cfg.pipeline.retry.max_retries, 3);
        assert_eq!(cfg.transcode.width, 640);
        assert_eq!(cfg.transcode.audio_channels, 1);
        assert!(cfg.pipeline.workers >= 1);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg = Config::from_json(
            r#"{
                "pipeline": { "workers": 8, "concurrency": { "transcode": 1 } },
                "transcode": { "fps": 1.0 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.workers, 8);
        // An explicit map replaces the default map entirely.
        assert_eq!(cfg.pipeline.concurrency.len(), 1);
        assert_eq!(cfg.pipeline.retry.base_delay_ms, 500);
        assert!(!cfg.pipeline.keep_artifacts);
        assert_eq!(cfg.transcode.fps, 1.0);
        assert_eq!(cfg.transcode.height, 360);
    }

    #[test]
    fn step_overrides_parse() {
        let cfg = Config::from_json(
            r#"{ "pipeline": { "steps": { "analyze": { "enabled": false, "timeout_secs": 30 } } } }"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.step_enabled("analyze"), Some(false));
        assert_eq!(cfg.pipeline.step_enabled("store"), None);
        assert_eq!(
            cfg.pipeline.steps["analyze"].timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn invalid_json_is_validation_error() {
        let err = Config::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_or_default_with_none() {
        let cfg = Config::load_or_default(None).unwrap();
        assert_eq!(cfg.transcode.video_bitrate, 400_000);
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/mediaflow.json"))).unwrap();
        assert_eq!(cfg.storage.db_path, PathBuf::from("./data/mediaflow.db"));
    }

    #[test]
    fn load_or_default_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();
        assert!(Config::load_or_default(Some(&path)).is_err());
    }

    #[test]
    fn validate_flags_zero_capacity_and_bad_hw_accel() {
        let mut cfg = Config::default();
        cfg.pipeline.concurrency.insert("transcode".into(), 0);
        cfg.transcode.hw_accel = Some("cuda".into());
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("pipeline.concurrency.transcode")));
        assert!(warnings.iter().any(|w| w.contains("hw_accel 'cuda'")));
    }

    #[test]
    fn validate_warns_about_missing_endpoint_unless_disabled() {
        let mut cfg = Config::default();
        assert!(cfg.validate().iter().any(|w| w.contains("analysis.endpoint")));

        cfg.pipeline.steps.insert(
            "analyze".into(),
            StepOverride {
                enabled: Some(false),
                ..Default::default()
            },
        );
        assert!(!cfg.validate().iter().any(|w| w.contains("analysis.endpoint")));
    }
}
