//! Shared fixtures for pipeline integration tests.
//!
//! Provides scriptable [`Step`] implementations and a [`Journal`] that
//! records when each step starts and finishes, so tests can check ordering
//! and timing properties of the executor.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mf_core::{Error, Result};
use mf_pipeline::{
    ConcurrencyLimiter, PipelineExecutor, RetryPolicy, Step, StepBag, StepContext, StepOutcome,
    StepRegistry,
};
use parking_lot::Mutex;
use tokio::time::Instant;

/// What a journal entry recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Start,
    Finish,
}

/// Start/finish log shared by every step in a test.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<(String, Mark, Instant)>>>,
}

impl Journal {
    pub fn record(&self, step: &str, mark: Mark) {
        self.entries.lock().push((step.to_string(), mark, Instant::now()));
    }

    pub fn entries(&self) -> Vec<(String, Mark, Instant)> {
        self.entries.lock().clone()
    }

    /// Step names in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, m, _)| *m == Mark::Start)
            .map(|(s, _, _)| s.clone())
            .collect()
    }

    /// Start instants of every attempt of `step`.
    pub fn starts_of(&self, step: &str) -> Vec<Instant> {
        self.entries
            .lock()
            .iter()
            .filter(|(s, m, _)| s == step && *m == Mark::Start)
            .map(|(_, _, t)| *t)
            .collect()
    }

    pub fn position(&self, step: &str, mark: Mark) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|(s, m, _)| s == step && *m == mark)
    }
}

/// How a [`Scripted`] step behaves on each attempt.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write `<ns>.value` and succeed.
    Succeed,
    /// Fail permanently.
    Fail,
    /// Fail transiently for the first `n` attempts, then succeed.
    FlakyFor(u32),
    /// Always fail transiently.
    AlwaysTransient,
    /// Sleep, then succeed.
    Sleep(Duration),
}

/// A step whose behavior is fixed by the test.
pub struct Scripted {
    pub name: String,
    pub behavior: Behavior,
    pub journal: Journal,
    pub attempts: Arc<AtomicU32>,
}

impl Scripted {
    pub fn new(name: &str, behavior: Behavior, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            journal: journal.clone(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl Step for Scripted {
    async fn run(&self, _ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.record(&self.name, Mark::Start);
        let result = match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(Error::Compression("corrupt bitstream".into())),
            Behavior::FlakyFor(n) if attempt <= n => {
                Err(Error::analysis_transient("503 Service Unavailable"))
            }
            Behavior::FlakyFor(_) => Ok(()),
            Behavior::AlwaysTransient => Err(Error::analysis_transient("429 Too Many Requests")),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        };
        self.journal.record(&self.name, Mark::Finish);
        result.map(|()| {
            bag.set("value", i64::from(attempt));
            StepOutcome::Completed
        })
    }
}

/// Records whether a field was visible when the step ran.
pub struct Observe {
    pub field: &'static str,
    pub seen: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl Step for Observe {
    async fn run(&self, _ctx: &StepContext, bag: &mut StepBag<'_>) -> Result<StepOutcome> {
        *self.seen.lock() = Some(bag.contains(self.field));
        bag.set("ran", true);
        Ok(StepOutcome::Completed)
    }
}

pub fn executor(registry: StepRegistry, retry: RetryPolicy) -> PipelineExecutor {
    PipelineExecutor::new(
        registry.build().expect("registry should build"),
        Arc::new(ConcurrencyLimiter::unlimited()),
        retry,
    )
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
    }
}
