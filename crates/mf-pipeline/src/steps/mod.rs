//! Built-in ingest steps.
//!
//! The product pipeline is a static table: [`definitions`] describes every
//! step, [`builtin_registry`] pairs each definition with its implementation.
//!
//! ```text
//! metadata ──► compress ──► analyze ──┐
//!     │                                ├──► store
//! checksum ──► dedup ─────────────────┘
//! ```

mod analyze;
mod checksum;
mod compress;
mod dedup;
mod metadata;
mod store;

pub use analyze::AnalyzeStep;
pub use checksum::{sha256_file, ChecksumStep};
pub use compress::CompressStep;
pub use dedup::DedupStep;
pub use metadata::MetadataStep;
pub use store::StoreStep;

use std::sync::Arc;
use std::time::Duration;

use mf_av::{MetadataExtractor, Transcoder};
use mf_core::config::{StepOverride, TranscodeConfig};
use mf_core::{Error, Result};
use mf_db::{get_conn, DbPool};
use rusqlite::Connection;

use crate::analysis::AnalysisService;
use crate::registry::StepRegistry;
use crate::step::StepDefinition;

pub const METADATA: &str = "metadata";
pub const CHECKSUM: &str = "checksum";
pub const DEDUP: &str = "dedup";
pub const COMPRESS: &str = "compress";
pub const ANALYZE: &str = "analyze";
pub const STORE: &str = "store";

/// Collaborators the built-in steps need.
#[derive(Clone)]
pub struct StepServices {
    pub extractor: Arc<dyn MetadataExtractor>,
    pub transcoder: Arc<dyn Transcoder>,
    pub transcode: TranscodeConfig,
    /// `None` disables the analyze step.
    pub analysis: Option<Arc<dyn AnalysisService>>,
    pub db: DbPool,
}

/// The built-in step table, in registration order.
pub fn definitions() -> Vec<StepDefinition> {
    vec![
        StepDefinition::builder(METADATA)
            .description("Extract container, stream and camera metadata")
            .concurrency_tag("probe")
            .critical(true)
            .timeout(Duration::from_secs(120))
            .build(),
        StepDefinition::builder(CHECKSUM)
            .description("SHA-256 of the source file")
            .critical(true)
            .build(),
        StepDefinition::builder(DEDUP)
            .description("Look up an existing record with the same checksum")
            .depends_on([CHECKSUM])
            .concurrency_tag("storage")
            .requires(["checksum.sha256"])
            .timeout(Duration::from_secs(30))
            .build(),
        StepDefinition::builder(COMPRESS)
            .description("Reduce the source to a small analysis copy")
            .depends_on([METADATA])
            .concurrency_tag("transcode")
            .timeout(Duration::from_secs(3600))
            .build(),
        StepDefinition::builder(ANALYZE)
            .description("Generative scene, audio and entity analysis")
            .depends_on([COMPRESS])
            .concurrency_tag("analysis")
            .retryable(true)
            .requires(["compress.output_path"])
            .timeout(Duration::from_secs(600))
            .build(),
        StepDefinition::builder(STORE)
            .description("Persist the media record and its scenes")
            .depends_on([METADATA, CHECKSUM, DEDUP, ANALYZE])
            .concurrency_tag("storage")
            .critical(true)
            .requires(["checksum.sha256", "metadata.container"])
            .timeout(Duration::from_secs(60))
            .build(),
    ]
}

/// Register every built-in step against `services`.
pub fn builtin_registry(services: StepServices) -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();
    for def in definitions() {
        let name = def.name().to_string();
        match name.as_str() {
            METADATA => registry.register(def, MetadataStep::new(Arc::clone(&services.extractor)))?,
            CHECKSUM => registry.register(def, ChecksumStep)?,
            DEDUP => registry.register(def, DedupStep::new(services.db.clone()))?,
            COMPRESS => registry.register(
                def,
                CompressStep::new(Arc::clone(&services.transcoder), services.transcode.clone()),
            )?,
            ANALYZE => {
                let def = if services.analysis.is_none() {
                    tracing::info!("No analysis service configured; analyze step disabled");
                    def.overridden(&StepOverride {
                        enabled: Some(false),
                        ..StepOverride::default()
                    })
                } else {
                    def
                };
                registry.register(def, AnalyzeStep::new(services.analysis.clone()))?
            }
            STORE => registry.register(def, StoreStep::new(services.db.clone()))?,
            other => return Err(Error::UnknownStep(other.to_string())),
        }
    }
    Ok(registry)
}

/// Run a database closure on the blocking pool.
pub(crate) async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = get_conn(&pool)?;
        f(&conn)
    })
    .await
    .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
}
