//! External tool detection and encoder selection.
//!
//! The [`ToolRegistry`] discovers and caches the locations of ffmpeg and
//! ffprobe, and decides once per process which H.264 encoder the transcoder
//! uses: the first hardware encoder that can actually encode a frame on this
//! machine, or `libx264` otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::command::ToolCommand;

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

/// Upper bound for a single encoder probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a single external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Human-readable tool name (e.g. "ffmpeg").
    pub name: String,
    /// Resolved path to the executable.
    pub path: PathBuf,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output, if available.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// H.264 encoder used for analysis copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoEncoder {
    VideoToolbox,
    Nvenc,
    Vaapi,
    Qsv,
    Software,
}

impl VideoEncoder {
    /// Hardware encoders in the order they are tried on this platform.
    pub fn hardware_candidates() -> &'static [VideoEncoder] {
        if cfg!(target_os = "macos") {
            &[VideoEncoder::VideoToolbox]
        } else {
            &[VideoEncoder::Nvenc, VideoEncoder::Qsv, VideoEncoder::Vaapi]
        }
    }

    /// Parse a configured `hw_accel` method. `None` and "auto" mean probe.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "videotoolbox" => Some(VideoEncoder::VideoToolbox),
            "nvenc" => Some(VideoEncoder::Nvenc),
            "vaapi" => Some(VideoEncoder::Vaapi),
            "qsv" => Some(VideoEncoder::Qsv),
            "none" => Some(VideoEncoder::Software),
            _ => None,
        }
    }

    /// FFmpeg encoder name.
    pub fn codec_name(self) -> &'static str {
        match self {
            VideoEncoder::VideoToolbox => "h264_videotoolbox",
            VideoEncoder::Nvenc => "h264_nvenc",
            VideoEncoder::Vaapi => "h264_vaapi",
            VideoEncoder::Qsv => "h264_qsv",
            VideoEncoder::Software => "libx264",
        }
    }

    pub fn is_hardware(self) -> bool {
        self != VideoEncoder::Software
    }

    /// Extra global arguments the ffmpeg CLI needs before `-i`.
    pub fn device_args(self) -> &'static [&'static str] {
        match self {
            VideoEncoder::Vaapi => &["-vaapi_device", "/dev/dri/renderD128"],
            _ => &[],
        }
    }

    /// Filters appended after scaling so frames reach the encoder in the
    /// memory/pixel format it expects.
    pub fn upload_filter(self) -> Option<&'static str> {
        match self {
            VideoEncoder::Vaapi => Some("format=nv12,hwupload"),
            VideoEncoder::Software => Some("format=yuv420p"),
            _ => None,
        }
    }
}

/// Registry holding discovered tool configurations.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
    encoder: OnceCell<VideoEncoder>,
}

impl ToolRegistry {
    /// Discover tools by searching `PATH` (or using overrides from config).
    ///
    /// A configured path is used only if it exists; otherwise [`which::which`]
    /// looks the tool up on `PATH`. Tools that are not found are omitted.
    pub fn discover(tools_config: &mf_core::config::ToolsConfig) -> Self {
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                "ffmpeg" => tools_config.ffmpeg_path.as_deref(),
                "ffprobe" => tools_config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match custom_path {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!("Configured {name} path {} does not exist; searching PATH", p.display());
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            if let Some(path) = resolved {
                tools.insert(
                    name.to_string(),
                    ToolConfig {
                        name: name.to_string(),
                        path,
                    },
                );
            }
        }

        Self {
            tools,
            encoder: OnceCell::new(),
        }
    }

    /// A registry with explicit tool paths and no discovery.
    pub fn with_tools(tools: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            tools: tools
                .into_iter()
                .map(|(name, path)| (name.clone(), ToolConfig { name, path }))
                .collect(),
            encoder: OnceCell::new(),
        }
    }

    /// Return the [`ToolConfig`] for the given tool, or a
    /// [`mf_core::Error::Tool`] if it was not found during discovery.
    pub fn require(&self, name: &str) -> mf_core::Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| {
            mf_core::Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(cfg) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(&cfg.path),
                    path: Some(cfg.path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }

    /// The video encoder for this process.
    ///
    /// An explicit `hw_accel` method is honoured as-is. Otherwise the first
    /// hardware candidate that survives a one-frame test encode is chosen.
    /// Either way the answer is computed once and cached.
    pub async fn video_encoder(&self, hw_accel: Option<&str>) -> VideoEncoder {
        *self
            .encoder
            .get_or_init(|| async {
                if let Some(forced) = hw_accel.and_then(VideoEncoder::from_method) {
                    tracing::info!(encoder = forced.codec_name(), "Using configured video encoder");
                    return forced;
                }
                let chosen = self.probe_hardware_encoder().await;
                tracing::info!(
                    encoder = chosen.codec_name(),
                    hardware = chosen.is_hardware(),
                    "Selected video encoder"
                );
                chosen
            })
            .await
    }

    async fn probe_hardware_encoder(&self) -> VideoEncoder {
        let Ok(ffmpeg) = self.require("ffmpeg") else {
            return VideoEncoder::Software;
        };

        for &candidate in VideoEncoder::hardware_candidates() {
            if encoder_works(&ffmpeg.path, candidate).await {
                return candidate;
            }
            tracing::debug!(encoder = candidate.codec_name(), "Hardware encoder unavailable");
        }
        VideoEncoder::Software
    }
}

/// Encode a single synthetic frame to the null muxer.
async fn encoder_works(ffmpeg: &Path, encoder: VideoEncoder) -> bool {
    let mut vf = String::from("scale=128:72");
    if let Some(upload) = encoder.upload_filter() {
        vf.push(',');
        vf.push_str(upload);
    }

    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.args(["-hide_banner", "-loglevel", "error"])
        .args(encoder.device_args().iter().copied())
        .args(["-f", "lavfi", "-i", "color=c=black:s=128x72:r=1"])
        .args(["-frames:v", "1", "-vf"])
        .arg(vf)
        .args(["-c:v", encoder.codec_name(), "-f", "null", "-"])
        .timeout(PROBE_TIMEOUT);
    cmd.execute().await.is_ok()
}

/// Run `<tool> -version` and return the first line of stdout.
fn detect_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg("-version")
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::config::ToolsConfig;

    #[test]
    fn discover_with_default_config() {
        let registry = ToolRegistry::discover(&ToolsConfig::default());
        // No tool is guaranteed in CI; the call itself must not panic.
        let _ = registry.check_all();
    }

    #[test]
    fn require_missing_tool_returns_error() {
        let registry = ToolRegistry::with_tools([]);
        let err = registry.require("ffmpeg").unwrap_err();
        assert!(err.to_string().contains("ffmpeg not found"));
    }

    #[test]
    fn check_all_returns_known_tools() {
        let registry = ToolRegistry::with_tools([]);
        let infos = registry.check_all();
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ffmpeg", "ffprobe"]);
        assert!(infos.iter().all(|i| !i.available));
    }

    #[test]
    fn method_parsing() {
        assert_eq!(VideoEncoder::from_method("nvenc"), Some(VideoEncoder::Nvenc));
        assert_eq!(VideoEncoder::from_method("none"), Some(VideoEncoder::Software));
        assert_eq!(VideoEncoder::from_method("auto"), None);
        assert_eq!(VideoEncoder::from_method("cuda"), None);
    }

    #[test]
    fn codec_names() {
        assert_eq!(VideoEncoder::Software.codec_name(), "libx264");
        assert_eq!(VideoEncoder::VideoToolbox.codec_name(), "h264_videotoolbox");
        assert!(!VideoEncoder::Software.is_hardware());
        assert!(VideoEncoder::Qsv.is_hardware());
    }

    #[tokio::test]
    async fn encoder_without_ffmpeg_falls_back_to_software() {
        let registry = ToolRegistry::with_tools([]);
        assert_eq!(registry.video_encoder(None).await, VideoEncoder::Software);
    }

    #[tokio::test]
    async fn encoder_choice_is_cached() {
        let registry = ToolRegistry::with_tools([]);
        assert_eq!(
            registry.video_encoder(Some("nvenc")).await,
            VideoEncoder::Nvenc
        );
        // A later call with a different preference sees the cached answer.
        assert_eq!(
            registry.video_encoder(Some("none")).await,
            VideoEncoder::Nvenc
        );
    }
}
