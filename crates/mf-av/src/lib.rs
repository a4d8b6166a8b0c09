//! # mf-av
//!
//! Audio/video tooling for the mediaflow pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe, and probe once per process which H.264 encoder to use.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Metadata extraction** ([`FfprobeExtractor`]) -- structured container,
//!   stream, and camera metadata from `ffprobe`.
//! - **Transcoding** ([`transcode`]) -- the streaming
//!   demux/decode/re-encode/mux engine behind the compress step, an
//!   ffmpeg-CLI backend and (with `native-ffmpeg`) an in-process backend.
//! - **Artifact management** ([`ArtifactDir`], [`OutputGuard`]) -- output
//!   paths that delete themselves unless the producer commits them.

pub mod artifacts;
pub mod command;
pub mod metadata;
pub mod tools;
pub mod transcode;

// ---- Re-exports for convenience ----

pub use artifacts::{ArtifactDir, OutputGuard};
pub use command::{ToolCommand, ToolOutput};
pub use metadata::{FfprobeExtractor, MediaMetadata, MetadataExtractor};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry, VideoEncoder};
pub use transcode::{FfmpegCliTranscoder, TranscodeStats, Transcoder};

#[cfg(feature = "native-ffmpeg")]
pub use transcode::native::NativeTranscoder;
