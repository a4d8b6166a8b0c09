use std::sync::Arc;

use async_trait::async_trait;
use mf_av::Transcoder;
use mf_core::config::TranscodeConfig;
use mf_core::Result;

use crate::bag::{FieldValue, StepBag};
use crate::step::{Step, StepContext, StepOutcome};

/// Writes `compress.output_path` and `compress.size_bytes`.
pub struct CompressStep {
    transcoder: Arc<dyn Transcoder>,
    config: TranscodeConfig,
}

impl CompressStep {
    pub fn new(transcoder: Arc<dyn Transcoder>, config: TranscodeConfig) -> Self {
        Self { transcoder, config }
    }
}

#[async_trait]
impl Step for CompressStep {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let output = self.transcoder.compress(&ctx.path, &self.config).await?;
        let size = tokio::fs::metadata(&output).await?.len();

        tracing::info!(
            file_id = %ctx.file_id,
            transcoder = self.transcoder.name(),
            output = %output.display(),
            size,
            "Compressed copy ready"
        );
        bag.set("output_path", FieldValue::Path(output));
        bag.set("size_bytes", size as i64);
        Ok(StepOutcome::Completed)
    }
}
