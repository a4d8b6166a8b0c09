//! Bounded-memory transcoding for the compress step.
//!
//! Every backend produces a small H.264/AAC MP4 sampled at the configured
//! frame rate. The CLI backend hands the whole transform to `ffmpeg`; the
//! native backend (feature `native-ffmpeg`) drives [`engine::run`] over an
//! in-process FFmpeg session. Either way the output path is guarded by an
//! [`OutputGuard`](crate::OutputGuard) so failures never leave partial files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mf_core::config::TranscodeConfig;

pub mod cli;
pub mod engine;
#[cfg(feature = "native-ffmpeg")]
pub mod native;

pub use cli::FfmpegCliTranscoder;
pub use engine::{Demuxed, FrameSampler, MediaSession, StreamKind, TranscodeStats};

/// Produces a reduced copy of a media file suitable for analysis.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Transcode `input` and return the path of the committed output.
    ///
    /// # Errors
    ///
    /// Returns [`mf_core::Error::Compression`] with the codec's message. The
    /// partial output has already been removed when this returns.
    async fn compress(&self, input: &Path, config: &TranscodeConfig) -> mf_core::Result<PathBuf>;
}
