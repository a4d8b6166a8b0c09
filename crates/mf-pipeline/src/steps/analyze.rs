use std::sync::Arc;

use async_trait::async_trait;
use mf_core::{Error, Result};

use crate::analysis::AnalysisService;
use crate::bag::StepBag;
use crate::step::{Step, StepContext, StepOutcome};

/// Sends the compressed copy for analysis. Writes `analyze.report` (the full
/// report as JSON), `analyze.summary` and `analyze.scene_count`.
pub struct AnalyzeStep {
    service: Option<Arc<dyn AnalysisService>>,
}

impl AnalyzeStep {
    pub fn new(service: Option<Arc<dyn AnalysisService>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Step for AnalyzeStep {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let Some(ref service) = self.service else {
            return Ok(StepOutcome::Skipped("no analysis service configured".into()));
        };
        let artifact = bag
            .path("compress.output_path")
            .ok_or_else(|| Error::missing_input(bag.namespace(), "compress.output_path"))?
            .to_path_buf();

        let report = service.analyze(&artifact).await?;
        report.validate()?;
        tracing::info!(
            file_id = %ctx.file_id,
            service = service.name(),
            attempt = ctx.attempt,
            scenes = report.scenes.len(),
            "Analysis complete"
        );

        let json = serde_json::to_value(&report)
            .map_err(|e| Error::Internal(format!("failed to encode analysis report: {e}")))?;
        bag.set("summary", report.summary.as_str());
        bag.set("scene_count", report.scenes.len() as i64);
        bag.set("report", json);
        Ok(StepOutcome::Completed)
    }
}
