//! Transcoding through the `ffmpeg` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mf_core::config::TranscodeConfig;

use super::Transcoder;
use crate::artifacts::ArtifactDir;
use crate::command::ToolCommand;
use crate::tools::{ToolRegistry, VideoEncoder};

/// Upper bound for one compress invocation; step timeouts normally fire first.
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(3600);

/// [`Transcoder`] that runs `ffmpeg` as a child process.
///
/// ffmpeg itself streams packets through decode, the `fps` filter, scaling
/// and encode, so memory use is independent of input length.
#[derive(Debug, Clone)]
pub struct FfmpegCliTranscoder {
    tools: Arc<ToolRegistry>,
    artifacts: ArtifactDir,
}

impl FfmpegCliTranscoder {
    pub fn new(tools: Arc<ToolRegistry>, artifacts: ArtifactDir) -> Self {
        Self { tools, artifacts }
    }
}

#[async_trait]
impl Transcoder for FfmpegCliTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg-cli"
    }

    async fn compress(&self, input: &Path, config: &TranscodeConfig) -> mf_core::Result<PathBuf> {
        let ffmpeg = self
            .tools
            .require("ffmpeg")
            .map_err(|e| mf_core::Error::Compression(e.to_string()))?
            .path
            .clone();
        let encoder = self.tools.video_encoder(config.hw_accel.as_deref()).await;
        let guard = self.artifacts.reserve(input, "mp4");
        let started = Instant::now();

        let mut cmd = ToolCommand::new(ffmpeg);
        cmd.args(ffmpeg_args(input, guard.path(), config, encoder))
            .timeout(TRANSCODE_TIMEOUT);

        if let Err(e) = cmd.execute().await {
            let message = match e {
                mf_core::Error::Tool { message, .. } => message,
                other => other.to_string(),
            };
            guard.discard(&message);
            return Err(mf_core::Error::Compression(message));
        }

        match std::fs::metadata(guard.path()) {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                guard.discard("ffmpeg produced no output");
                return Err(mf_core::Error::Compression(
                    "ffmpeg exited successfully but produced no output".into(),
                ));
            }
        }

        let output = guard.commit();
        tracing::debug!(
            input = %input.display(),
            output = %output.display(),
            encoder = encoder.codec_name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compressed media"
        );
        Ok(output)
    }
}

/// Build the ffmpeg argument list for one compress run.
pub fn ffmpeg_args(
    input: &Path,
    output: &Path,
    config: &TranscodeConfig,
    encoder: VideoEncoder,
) -> Vec<String> {
    let mut filters = format!(
        "fps={},scale={}:{}",
        config.fps, config.width, config.height
    );
    if let Some(upload) = encoder.upload_filter() {
        filters.push(',');
        filters.push_str(upload);
    }

    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-y"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(encoder.device_args().iter().map(|s| s.to_string()));
    args.push("-i".into());
    args.push(input.to_string_lossy().to_string());
    let video_bitrate = config.video_bitrate.to_string();
    let audio_bitrate = config.audio_bitrate.to_string();
    let channels = config.audio_channels.to_string();
    let rest: [&str; 20] = [
        "-map", "0:v:0?",
        "-map", "0:a:0?",
        "-vf", filters.as_str(),
        "-c:v", encoder.codec_name(),
        "-b:v", video_bitrate.as_str(),
        "-c:a", "aac",
        "-b:a", audio_bitrate.as_str(),
        "-ac", channels.as_str(),
        "-movflags", "+faststart",
        "-f", "mp4",
    ];
    args.extend(rest.iter().map(|s| s.to_string()));
    args.push(output.to_string_lossy().to_string());
    args
}
