//! Artifact paths for intermediate pipeline outputs.
//!
//! An [`ArtifactDir`] hands out unique output paths; each comes wrapped in an
//! [`OutputGuard`] that deletes the file on drop unless the producer calls
//! [`OutputGuard::commit`]. A failed or cancelled transcode therefore never
//! leaves a truncated container behind.

use std::path::{Path, PathBuf};

/// Directory holding compressed copies produced for analysis.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Use `root`, creating it if necessary.
    pub fn new(root: impl Into<PathBuf>) -> mf_core::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            mf_core::Error::tool(
                "artifacts",
                format!("failed to create {}: {e}", root.display()),
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a fresh output path derived from the input's file stem.
    ///
    /// The name carries a random suffix so two passes over the same input, or
    /// two inputs with the same stem, never collide.
    pub fn reserve(&self, input: &Path, extension: &str) -> OutputGuard {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{stem}.{}.{extension}", &suffix[..8]);
        OutputGuard::new(self.root.join(name))
    }
}

/// Output file that is removed on drop unless committed.
#[derive(Debug)]
pub struct OutputGuard {
    path: PathBuf,
    armed: bool,
}

impl OutputGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file and return its path.
    pub fn commit(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Delete the file now, logging why.
    pub fn discard(mut self, reason: &str) {
        self.remove(reason);
        self.armed = false;
    }

    fn remove(&self, reason: &str) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::warn!(
                path = %self.path.display(),
                reason,
                "Discarded partial output"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                path = %self.path.display(),
                "Failed to remove partial output: {e}"
            ),
        }
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.armed {
            self.remove("producer dropped the output without committing");
        }
    }
}
