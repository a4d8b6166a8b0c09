//! # mf-pipeline
//!
//! The per-file ingest engine.
//!
//! This crate provides:
//!
//! - **[`Step`]** trait and **[`StepDefinition`]** -- one named unit of work
//!   with its dependencies, concurrency tag and failure policy.
//! - **[`StepRegistry`]** -- explicit registration, graph validation and a
//!   deterministic [`ExecutionOrder`].
//! - **[`DataBag`]** -- the typed per-file record, with namespace-scoped
//!   writes through [`StepBag`].
//! - **[`ConcurrencyLimiter`]** -- per-tag ceilings shared by every file.
//! - **[`PipelineExecutor`]** -- runs one file: skip propagation, retry with
//!   backoff, timeouts, panic capture and cancellation.
//! - **[`RunCoordinator`]** -- a bounded pool of files over one executor.
//! - **Built-in steps** ([`steps`]) -- metadata, checksum, dedup, compress,
//!   analyze and store.

pub mod analysis;
pub mod bag;
pub mod coordinator;
pub mod executor;
pub mod limiter;
pub mod registry;
pub mod retry;
pub mod step;
pub mod steps;

// Re-export key types at the crate root.
pub use analysis::{AnalysisReport, AnalysisService};
pub use bag::{DataBag, FieldValue, StepBag};
pub use coordinator::{RunCoordinator, RunProgress};
pub use executor::{PipelineExecutor, PipelineRun, RunStatus, StepError, StepResult, StepStatus};
pub use limiter::{ConcurrencyLimiter, ConcurrencySlot};
pub use registry::{ExecutionOrder, PlannedStep, StepRegistry};
pub use retry::RetryPolicy;
pub use step::{Step, StepContext, StepDefinition, StepDefinitionBuilder, StepOutcome};
pub use steps::{builtin_registry, StepServices};
