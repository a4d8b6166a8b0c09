//! Metadata extraction.
//!
//! [`FfprobeExtractor`] shells out to
//! `ffprobe -v error -print_format json -show_format -show_streams` and maps
//! the JSON output into [`MediaMetadata`]. Any tool or parse failure surfaces
//! as [`mf_core::Error::Extraction`] carrying ffprobe's diagnostic text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Structured metadata for one media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// First entry of ffprobe's `format_name` (e.g. "mov", "matroska").
    pub container: String,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub creation_time: Option<String>,
    pub tracks: Vec<TrackInfo>,
}

/// One demuxable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub index: u32,
    /// "video", "audio", "subtitle", "data".
    pub kind: String,
    pub codec: Option<String>,
    pub language: Option<String>,
}

/// Source of structured metadata.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, path: &Path) -> mf_core::Result<MediaMetadata>;
}

/// A [`MetadataExtractor`] backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeExtractor {
    ffprobe_path: PathBuf,
}

impl FfprobeExtractor {
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self { ffprobe_path }
    }

    /// Use the ffprobe found during tool discovery.
    pub fn from_registry(tools: &Arc<ToolRegistry>) -> mf_core::Result<Self> {
        let cfg = tools.require("ffprobe")?;
        Ok(Self::new(cfg.path.clone()))
    }
}

#[async_trait]
impl MetadataExtractor for FfprobeExtractor {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn extract(&self, path: &Path) -> mf_core::Result<MediaMetadata> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args([
            "-v", "error",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(path.to_string_lossy().as_ref());

        let output = cmd.execute().await.map_err(|e| match e {
            mf_core::Error::Tool { message, .. } => mf_core::Error::extraction("ffprobe", message),
            other => other,
        })?;

        parse_ffprobe_json(&output.stdout)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Tag keys that carry the recording device, most specific first.
const MAKE_TAGS: &[&str] = &["com.apple.quicktime.make", "com.android.manufacturer", "make"];
const MODEL_TAGS: &[&str] = &["com.apple.quicktime.model", "com.android.model", "model"];

/// Map ffprobe's JSON document into [`MediaMetadata`].
pub fn parse_ffprobe_json(json: &str) -> mf_core::Result<MediaMetadata> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| mf_core::Error::extraction("ffprobe", format!("JSON parse error: {e}")))?;

    let format = output.format.ok_or_else(|| {
        mf_core::Error::extraction("ffprobe", "no format section; not a media file?")
    })?;

    let container = format
        .format_name
        .as_deref()
        .and_then(|n| n.split(',').next())
        .unwrap_or("unknown")
        .to_string();

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let tracks = output
        .streams
        .iter()
        .map(|s| TrackInfo {
            index: s.index,
            kind: s.codec_type.clone().unwrap_or_else(|| "unknown".into()),
            codec: s.codec_name.clone(),
            language: s.tags.get("language").cloned(),
        })
        .collect();

    Ok(MediaMetadata {
        container,
        duration_secs: format.duration.as_deref().and_then(|s| s.parse().ok()),
        size_bytes: format.size.as_deref().and_then(|s| s.parse().ok()),
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
        frame_rate: video
            .and_then(|s| s.r_frame_rate.as_deref())
            .and_then(parse_frame_rate),
        camera_make: first_tag(&format.tags, MAKE_TAGS),
        camera_model: first_tag(&format.tags, MODEL_TAGS),
        creation_time: format.tags.get("creation_time").cloned(),
        tracks,
    })
}

fn first_tag(tags: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| tags.get(*k))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    match rate_str.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate_str.parse().ok(),
    }
}
