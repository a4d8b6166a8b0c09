//! Per-file pipeline executor.
//!
//! Walks an [`ExecutionOrder`] for one file, strictly sequentially. For each
//! step it decides whether to run, skip or fail fast, acquires the step's
//! concurrency slot, runs it under a timeout with panic capture, retries
//! transient failures with backoff, and records a [`StepResult`]. The run
//! never stops early except on cancellation: a failure only affects the
//! steps that depend on it.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use mf_core::events::{EventBus, EventPayload};
use mf_core::{Error, FileId, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bag::{DataBag, FieldValue};
use crate::limiter::ConcurrencyLimiter;
use crate::registry::{ExecutionOrder, PlannedStep};
use crate::retry::RetryPolicy;
use crate::step::{StepContext, StepOutcome};

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Terminal state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Only non-critical steps failed.
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Serializable snapshot of the error that failed a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
    pub transient: bool,
}

impl From<&Error> for StepError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            transient: e.is_transient(),
        }
    }
}

/// Outcome of one step for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub status: StepStatus,
    /// Present iff `status` is `Failed`.
    pub error: Option<StepError>,
    /// Attempts actually started. Zero for steps that never ran.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub skip_reason: Option<String>,
}

impl StepResult {
    fn skipped(step: &str, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step: step.to_string(),
            status: StepStatus::Skipped,
            error: None,
            attempts: 0,
            started_at: now,
            finished_at: now,
            skip_reason: Some(reason.into()),
        }
    }

    fn failed_before_start(step: &str, error: &Error) -> Self {
        let now = Utc::now();
        Self {
            step: step.to_string(),
            status: StepStatus::Failed,
            error: Some(error.into()),
            attempts: 0,
            started_at: now,
            finished_at: now,
            skip_reason: None,
        }
    }
}

/// Everything that happened to one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub file_id: FileId,
    pub path: PathBuf,
    /// One result per step, in execution order.
    pub steps: Vec<StepResult>,
    pub status: RunStatus,
    /// Final state of the data bag.
    pub bag: DataBag,
    /// Set when the run itself was aborted rather than completed.
    pub error: Option<String>,
}

impl PipelineRun {
    /// A failed run with no step results, for files whose run was aborted.
    pub fn aborted(file_id: FileId, path: PathBuf, error: impl Into<String>) -> Self {
        Self {
            file_id,
            path,
            steps: Vec::new(),
            status: RunStatus::Failed,
            bag: DataBag::new(),
            error: Some(error.into()),
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|r| r.step == name)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|r| r.status == StepStatus::Failed)
    }
}

/// Runs the pipeline for one file at a time. Cheap to clone and share.
#[derive(Clone)]
pub struct PipelineExecutor {
    order: ExecutionOrder,
    limiter: Arc<ConcurrencyLimiter>,
    retry: RetryPolicy,
    events: Option<Arc<EventBus>>,
}

impl PipelineExecutor {
    pub fn new(order: ExecutionOrder, limiter: Arc<ConcurrencyLimiter>, retry: RetryPolicy) -> Self {
        Self {
            order,
            limiter,
            retry,
            events: None,
        }
    }

    /// Broadcast step and run lifecycle events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn order(&self) -> &ExecutionOrder {
        &self.order
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Run every step for one file.
    ///
    /// The executor seeds `input.path` and `input.file_id` into `bag`. Never
    /// returns an error: every failure is recorded in the returned run.
    pub async fn run(
        &self,
        file_id: FileId,
        path: impl Into<PathBuf>,
        mut bag: DataBag,
        cancel: &CancellationToken,
    ) -> PipelineRun {
        let path = path.into();
        {
            let mut input = bag.scoped("input");
            input.set("path", FieldValue::Path(path.clone()));
            input.set("file_id", file_id.to_string());
        }

        tracing::info!(file_id = %file_id, path = %path.display(), "Run started");
        self.emit(EventPayload::RunStarted {
            file_id,
            path: path.display().to_string(),
        });

        let mut status = RunStatus::Success;
        let mut results = Vec::with_capacity(self.order.len());
        // Step name -> the critical step whose failure blocks it.
        let mut blocked: HashMap<&str, String> = HashMap::new();

        for planned in self.order.steps() {
            let def = &planned.def;
            let name = def.name();

            let result = if !def.enabled() {
                StepResult::skipped(name, "disabled")
            } else if let Some(root) = def.depends_on().iter().find_map(|d| blocked.get(d.as_str())) {
                let root = root.clone();
                let reason = format!("critical step '{root}' failed");
                blocked.insert(name, root);
                StepResult::skipped(name, reason)
            } else if cancel.is_cancelled() {
                StepResult::failed_before_start(name, &Error::Cancelled)
            } else if let Some(field) = def.requires().iter().find(|f| !bag.contains(f)) {
                StepResult::failed_before_start(name, &Error::missing_input(name, field.as_str()))
            } else {
                self.run_step(planned, file_id, &path, &mut bag, cancel).await
            };

            if result.status == StepStatus::Failed {
                bag.clear_namespace(name);
                let cancelled = result.error.as_ref().is_some_and(|e| e.kind == "cancelled");
                if cancelled || def.critical() {
                    status = RunStatus::Failed;
                } else if status == RunStatus::Success {
                    status = RunStatus::Partial;
                }
                if def.critical() && !cancelled {
                    blocked.insert(name, name.to_string());
                }
            }

            match result.status {
                StepStatus::Failed => tracing::warn!(
                    file_id = %file_id,
                    step = name,
                    attempts = result.attempts,
                    error = %result.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default(),
                    "Step failed"
                ),
                StepStatus::Skipped => tracing::debug!(
                    file_id = %file_id,
                    step = name,
                    reason = result.skip_reason.as_deref().unwrap_or_default(),
                    "Step skipped"
                ),
                StepStatus::Success => tracing::debug!(
                    file_id = %file_id,
                    step = name,
                    attempts = result.attempts,
                    "Step completed"
                ),
            }
            self.emit(EventPayload::StepFinished {
                file_id,
                step: name.to_string(),
                status: result.status.as_str().to_string(),
                error: result.error.as_ref().map(|e| e.message.clone()),
            });
            results.push(result);
        }

        tracing::info!(file_id = %file_id, status = status.as_str(), "Run finished");
        self.emit(EventPayload::RunFinished {
            file_id,
            status: status.as_str().to_string(),
        });

        PipelineRun {
            file_id,
            path,
            steps: results,
            status,
            bag,
            error: None,
        }
    }

    /// Acquire the slot, then attempt the step until it succeeds, fails
    /// permanently, runs out of retries, or the run is cancelled.
    async fn run_step(
        &self,
        planned: &PlannedStep,
        file_id: FileId,
        path: &std::path::Path,
        bag: &mut DataBag,
        cancel: &CancellationToken,
    ) -> StepResult {
        let def = &planned.def;
        let name = def.name();
        let started_at = Utc::now();

        let acquired = tokio::select! {
            slot = self.limiter.acquire(def.concurrency_tag()) => slot,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        let _slot = match acquired {
            Ok(slot) => slot,
            Err(e) => return StepResult::failed_before_start(name, &e),
        };

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            self.emit(EventPayload::StepStarted {
                file_id,
                step: name.to_string(),
                attempt: attempts,
            });
            let ctx = StepContext {
                file_id,
                path: path.to_path_buf(),
                attempt: attempts,
                cancel: cancel.clone(),
            };
            let span = tracing::info_span!("step", file_id = %file_id, step = name, attempt = attempts);

            bag.clear_namespace(name);
            let result = attempt(planned, &ctx, bag).instrument(span).await;

            match result {
                Err(e) if self.retry.should_retry(def, &e, attempts) => {
                    if !cancel.is_cancelled() {
                        let delay = self.retry.delay_for(attempts - 1);
                        tracing::warn!(
                            file_id = %file_id,
                            step = name,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient failure, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancel.cancelled() => {}
                        }
                    }
                    // A retry the cancellation prevented counts as cancelled.
                    tracing::info!(
                        file_id = %file_id,
                        step = name,
                        attempt = attempts,
                        error = %e,
                        "Retry abandoned, run cancelled"
                    );
                    break Err(Error::Cancelled);
                }
                other => break other,
            }
        };

        let finished_at = Utc::now();
        match outcome {
            Ok(StepOutcome::Completed) => StepResult {
                step: name.to_string(),
                status: StepStatus::Success,
                error: None,
                attempts,
                started_at,
                finished_at,
                skip_reason: None,
            },
            Ok(StepOutcome::Skipped(reason)) => StepResult {
                step: name.to_string(),
                status: StepStatus::Skipped,
                error: None,
                attempts,
                started_at,
                finished_at,
                skip_reason: Some(reason),
            },
            Err(e) => StepResult {
                step: name.to_string(),
                status: StepStatus::Failed,
                error: Some((&e).into()),
                attempts,
                started_at,
                finished_at,
                skip_reason: None,
            },
        }
    }

    fn emit(&self, payload: EventPayload) {
        if let Some(ref bus) = self.events {
            bus.publish(payload);
        }
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("steps", &self.order.names())
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .finish()
    }
}

/// One attempt: timeout and panic capture around the step's own future.
async fn attempt(planned: &PlannedStep, ctx: &StepContext, bag: &mut DataBag) -> Result<StepOutcome> {
    let name = planned.def.name();
    let mut view = bag.scoped(name);
    let fut = AssertUnwindSafe(planned.step.run(ctx, &mut view)).catch_unwind();

    let caught = match planned.def.timeout() {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(caught) => caught,
            Err(_) => {
                return Err(Error::StepTimeout {
                    step: name.to_string(),
                    after: limit,
                })
            }
        },
        None => fut.await,
    };

    caught.unwrap_or_else(|payload| {
        Err(Error::Internal(format!(
            "step panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::StepBag;
    use crate::registry::StepRegistry;
    use crate::step::{Step, StepDefinition};
    use async_trait::async_trait;

    struct Writes(&'static str, i64);

    #[async_trait]
    impl Step for Writes {
        async fn run(&self, _ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
            bag.set(self.0, self.1);
            Ok(StepOutcome::Completed)
        }
    }

    struct Panics;

    #[async_trait]
    impl Step for Panics {
        async fn run(&self, _ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
            bag.set("half_written", true);
            panic!("decoder state corrupted");
        }
    }

    struct NothingToDo;

    #[async_trait]
    impl Step for NothingToDo {
        async fn run(&self, _ctx: &StepContext, _bag: &mut StepBag<'_>) -> Result<StepOutcome> {
            Ok(StepOutcome::Skipped("no audio track".into()))
        }
    }

    fn executor(reg: StepRegistry) -> PipelineExecutor {
        PipelineExecutor::new(
            reg.build().unwrap(),
            Arc::new(ConcurrencyLimiter::unlimited()),
            RetryPolicy::none(),
        )
    }

    async fn run(exec: &PipelineExecutor) -> PipelineRun {
        exec.run(FileId::new(), "/media/clip.mov", DataBag::new(), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn seeds_input_fields() {
        let mut reg = StepRegistry::new();
        reg.register(StepDefinition::builder("a").build(), Writes("n", 1)).unwrap();
        let run = run(&executor(reg)).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.bag.path("input.path"), Some(std::path::Path::new("/media/clip.mov")));
        assert_eq!(run.bag.text("input.file_id"), Some(run.file_id.to_string().as_str()));
        assert_eq!(run.bag.integer("a.n"), Some(1));
    }

    #[tokio::test]
    async fn panic_is_a_failed_step() {
        let mut reg = StepRegistry::new();
        reg.register(StepDefinition::builder("boom").build(), Panics).unwrap();
        reg.register(StepDefinition::builder("after").build(), Writes("n", 2)).unwrap();

        let run = run(&executor(reg)).await;
        let boom = run.step("boom").unwrap();
        assert_eq!(boom.status, StepStatus::Failed);
        let err = boom.error.as_ref().unwrap();
        assert_eq!(err.kind, "internal");
        assert!(err.message.contains("decoder state corrupted"));
        // Partial writes of a failed step are discarded.
        assert!(!run.bag.contains("boom.half_written"));
        assert_eq!(run.step("after").unwrap().status, StepStatus::Success);
        assert_eq!(run.status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn disabled_dependency_with_required_field_fails_fast() {
        let mut reg = StepRegistry::new();
        reg.register(StepDefinition::builder("compress").enabled(false).build(), Writes("output_path", 0))
            .unwrap();
        reg.register(
            StepDefinition::builder("analyze")
                .depends_on(["compress"])
                .requires(["compress.output_path"])
                .build(),
            Writes("summary", 0),
        )
        .unwrap();
        reg.register(
            StepDefinition::builder("thumbs").depends_on(["compress"]).build(),
            Writes("count", 3),
        )
        .unwrap();

        let run = run(&executor(reg)).await;
        let compress = run.step("compress").unwrap();
        assert_eq!(compress.status, StepStatus::Skipped);
        assert_eq!(compress.skip_reason.as_deref(), Some("disabled"));

        let analyze = run.step("analyze").unwrap();
        assert_eq!(analyze.status, StepStatus::Failed);
        assert_eq!(analyze.attempts, 0);
        assert_eq!(analyze.error.as_ref().unwrap().kind, "missing_required_input");

        // Without a declared requirement the disabled dependency is satisfied.
        assert_eq!(run.step("thumbs").unwrap().status, StepStatus::Success);
    }

    #[tokio::test]
    async fn step_reported_skip_is_not_a_failure() {
        let mut reg = StepRegistry::new();
        reg.register(StepDefinition::builder("audio").critical(true).build(), NothingToDo)
            .unwrap();
        reg.register(StepDefinition::builder("next").depends_on(["audio"]).build(), Writes("n", 1))
            .unwrap();

        let run = run(&executor(reg)).await;
        let audio = run.step("audio").unwrap();
        assert_eq!(audio.status, StepStatus::Skipped);
        assert_eq!(audio.attempts, 1);
        assert_eq!(audio.skip_reason.as_deref(), Some("no audio track"));
        assert_eq!(run.step("next").unwrap().status, StepStatus::Success);
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn events_cover_every_step() {
        let mut reg = StepRegistry::new();
        reg.register(StepDefinition::builder("a").build(), Writes("n", 1)).unwrap();
        reg.register(StepDefinition::builder("b").enabled(false).build(), Writes("n", 1)).unwrap();
        let bus = Arc::new(EventBus::new(64));
        let exec = executor(reg).with_events(Arc::clone(&bus));
        let run = run(&exec).await;

        let events: Vec<_> = bus.recent_events(100).into_iter().rev().map(|e| e.payload).collect();
        assert!(matches!(events.first(), Some(EventPayload::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(EventPayload::RunFinished { status, .. }) if status == "success"
        ));
        let finished: Vec<(String, String)> = events
            .iter()
            .filter_map(|e| match e {
                EventPayload::StepFinished { step, status, .. } => Some((step.clone(), status.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            finished,
            vec![("a".into(), "success".into()), ("b".into(), "skipped".into())]
        );
        assert!(events.iter().all(|e| e.file_id() == run.file_id));
    }

    #[test]
    fn panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
