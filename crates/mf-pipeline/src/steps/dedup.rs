use async_trait::async_trait;
use mf_core::{Error, Result};
use mf_db::queries::media;
use mf_db::DbPool;

use crate::bag::StepBag;
use crate::step::{Step, StepContext, StepOutcome};

/// Writes `dedup.is_duplicate`, plus `dedup.duplicate_of` when a record with
/// the same checksum already exists.
pub struct DedupStep {
    db: DbPool,
}

impl DedupStep {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Step for DedupStep {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let checksum = bag
            .text("checksum.sha256")
            .ok_or_else(|| Error::missing_input(bag.namespace(), "checksum.sha256"))?
            .to_string();

        let existing = super::with_conn(&self.db, move |conn| {
            media::get_media_by_checksum(conn, &checksum)
        })
        .await?;

        match existing {
            Some(record) => {
                tracing::info!(
                    file_id = %ctx.file_id,
                    media_id = %record.id,
                    "Duplicate of existing media"
                );
                bag.set("is_duplicate", true);
                bag.set("duplicate_of", record.id.to_string());
            }
            None => bag.set("is_duplicate", false),
        }
        Ok(StepOutcome::Completed)
    }
}
