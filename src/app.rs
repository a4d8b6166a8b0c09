//! Wiring from configuration to a ready-to-run coordinator.
//!
//! Everything that can fail here is a startup error: the registry is built
//! and validated before any file is touched.

use std::sync::Arc;

use mf_av::{ArtifactDir, FfprobeExtractor, ToolRegistry, Transcoder};
use mf_core::config::Config;
use mf_core::events::EventBus;
use mf_db::DbPool;
use mf_pipeline::{
    builtin_registry, AnalysisService, ConcurrencyLimiter, ExecutionOrder, PipelineExecutor,
    RetryPolicy, RunCoordinator, StepServices,
};

use crate::analysis_client::HttpAnalysisService;

/// Capacity of the in-process event bus.
const EVENT_CAPACITY: usize = 1024;

/// Bag key of the compressed copy handed to analysis.
const ANALYSIS_ARTIFACT: &str = "compress.output_path";

/// Collaborators backed by real tools and services.
pub fn build_services(config: &Config, tools: &Arc<ToolRegistry>, db: DbPool) -> mf_core::Result<StepServices> {
    let ffprobe = match tools.require("ffprobe") {
        Ok(cfg) => cfg.path.clone(),
        Err(_) => {
            tracing::warn!("ffprobe not found; metadata extraction will fail for every file");
            "ffprobe".into()
        }
    };
    let artifacts = ArtifactDir::new(config.pipeline.work_dir.clone())?;

    let analysis = HttpAnalysisService::from_config(&config.analysis)?
        .map(|client| Arc::new(client) as Arc<dyn AnalysisService>);
    if analysis.is_none() {
        tracing::info!("No analysis endpoint configured; analyze step disabled");
    }

    Ok(StepServices {
        extractor: Arc::new(FfprobeExtractor::new(ffprobe)),
        transcoder: transcoder(tools, artifacts),
        transcode: config.transcode.clone(),
        analysis,
        db,
    })
}

#[cfg(feature = "native-ffmpeg")]
fn transcoder(tools: &Arc<ToolRegistry>, artifacts: ArtifactDir) -> Arc<dyn Transcoder> {
    Arc::new(mf_av::NativeTranscoder::new(Arc::clone(tools), artifacts))
}

#[cfg(not(feature = "native-ffmpeg"))]
fn transcoder(tools: &Arc<ToolRegistry>, artifacts: ArtifactDir) -> Arc<dyn Transcoder> {
    Arc::new(mf_av::FfmpegCliTranscoder::new(Arc::clone(tools), artifacts))
}

/// Register the built-in steps, apply configured overrides and validate the
/// graph.
pub fn build_order(config: &Config, services: StepServices) -> mf_core::Result<ExecutionOrder> {
    let mut registry = builtin_registry(services)?;
    registry.apply_overrides(&config.pipeline.steps)?;
    registry.build()
}

/// Executor and coordinator for a validated order.
pub fn build_coordinator(
    config: &Config,
    order: ExecutionOrder,
    events: Arc<EventBus>,
) -> mf_core::Result<RunCoordinator> {
    let limiter = ConcurrencyLimiter::new(&config.pipeline.concurrency)?;
    let executor = PipelineExecutor::new(
        order,
        Arc::new(limiter),
        RetryPolicy::from_config(&config.pipeline.retry),
    )
    .with_events(events);
    let coordinator = RunCoordinator::new(executor, config.pipeline.workers);
    if config.pipeline.keep_artifacts {
        return Ok(coordinator);
    }
    Ok(coordinator.with_scratch_fields([ANALYSIS_ARTIFACT]))
}

/// A fully wired pipeline.
pub struct App {
    pub coordinator: RunCoordinator,
    pub events: Arc<EventBus>,
}

impl App {
    pub fn from_config(config: &Config) -> mf_core::Result<Self> {
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        let db = mf_db::init_pool(&config.storage.db_path)?;
        let services = build_services(config, &tools, db)?;
        let order = build_order(config, services)?;
        let events = Arc::new(EventBus::new(EVENT_CAPACITY));
        let coordinator = build_coordinator(config, order, Arc::clone(&events))?;

        tracing::info!(
            steps = ?coordinator.executor().order().enabled_names(),
            workers = coordinator.workers(),
            "Pipeline ready"
        );
        Ok(Self { coordinator, events })
    }
}
