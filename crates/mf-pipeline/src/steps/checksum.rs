use std::fs::File;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use mf_core::{Error, Result};
use sha2::{Digest, Sha256};

use crate::bag::StepBag;
use crate::step::{Step, StepContext, StepOutcome};

const CHUNK_SIZE: usize = 64 * 1024;

/// Writes `checksum.sha256` and `checksum.size_bytes`.
pub struct ChecksumStep;

#[async_trait]
impl Step for ChecksumStep {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let path = ctx.path.clone();
        let (digest, size) = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))??;

        tracing::debug!(file_id = %ctx.file_id, sha256 = %digest, size, "Checksum computed");
        bag.set("sha256", digest);
        bag.set("size_bytes", size as i64);
        Ok(StepOutcome::Completed)
    }
}

/// Hex SHA-256 and byte length of a file, read in fixed-size chunks.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}
