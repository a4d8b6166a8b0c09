//! Step definitions and the [`Step`] trait.
//!
//! A [`StepDefinition`] is the static description of a step: its name,
//! dependencies, concurrency tag and failure policy. The [`Step`] trait is
//! the work itself. The executor owns retry, timeout and propagation; a step
//! only reports what happened through its return value.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use mf_core::config::StepOverride;
use mf_core::FileId;
use tokio_util::sync::CancellationToken;

use crate::bag::StepBag;

/// Immutable description of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDefinition {
    name: String,
    enabled: bool,
    description: String,
    depends_on: Vec<String>,
    concurrency_tag: Option<String>,
    critical: bool,
    retryable: bool,
    timeout: Option<Duration>,
    requires: Vec<String>,
}

impl StepDefinition {
    /// Start building a definition. Steps are enabled, non-critical and
    /// non-retryable unless stated otherwise.
    pub fn builder(name: impl Into<String>) -> StepDefinitionBuilder {
        StepDefinitionBuilder {
            def: StepDefinition {
                name: name.into(),
                enabled: true,
                description: String::new(),
                depends_on: Vec::new(),
                concurrency_tag: None,
                critical: false,
                retryable: false,
                timeout: None,
                requires: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Dependencies in declaration order, without duplicates.
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// `None` means the step is not rate limited.
    pub fn concurrency_tag(&self) -> Option<&str> {
        self.concurrency_tag.as_deref()
    }

    pub fn critical(&self) -> bool {
        self.critical
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fully-qualified fields (`"<step>.<field>"`) that must be present in
    /// the data bag before this step may start.
    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// A copy with configuration overrides applied.
    pub(crate) fn overridden(&self, o: &StepOverride) -> Self {
        let mut def = self.clone();
        if let Some(enabled) = o.enabled {
            def.enabled = enabled;
        }
        if let Some(critical) = o.critical {
            def.critical = critical;
        }
        if let Some(timeout) = o.timeout() {
            def.timeout = Some(timeout);
        }
        def
    }
}

/// Builder for [`StepDefinition`].
#[derive(Debug, Clone)]
pub struct StepDefinitionBuilder {
    def: StepDefinition,
}

impl StepDefinitionBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.def.enabled = enabled;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.def.description = description.into();
        self
    }

    /// Add dependencies. Repeated names are kept once, in first-seen order.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.def.depends_on.contains(&dep) {
                self.def.depends_on.push(dep);
            }
        }
        self
    }

    /// An empty tag means unlimited.
    pub fn concurrency_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.def.concurrency_tag = (!tag.is_empty()).then_some(tag);
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.def.critical = critical;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.def.retryable = retryable;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.def.timeout = Some(timeout);
        self
    }

    pub fn requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.def.requires.contains(&field) {
                self.def.requires.push(field);
            }
        }
        self
    }

    pub fn build(self) -> StepDefinition {
        self.def
    }
}

/// What a step reports on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The step decided there was nothing to do.
    Skipped(String),
}

/// Per-attempt information handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub file_id: FileId,
    pub path: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run is cancelled. Long-running steps may watch it
    /// to stop early; the executor never starts new steps once it fires.
    pub cancel: CancellationToken,
}

/// One named unit of work.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &StepContext, bag: &mut StepBag<'_>) -> mf_core::Result<StepOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let def = StepDefinition::builder("checksum").build();
        assert_eq!(def.name(), "checksum");
        assert!(def.enabled());
        assert!(!def.critical());
        assert!(!def.retryable());
        assert!(def.concurrency_tag().is_none());
        assert!(def.timeout().is_none());
        assert!(def.depends_on().is_empty());
    }

    #[test]
    fn dependencies_are_an_ordered_set() {
        let def = StepDefinition::builder("store")
            .depends_on(["metadata", "checksum"])
            .depends_on(["metadata", "dedup"])
            .build();
        assert_eq!(def.depends_on(), ["metadata", "checksum", "dedup"]);
    }

    #[test]
    fn empty_tag_is_unlimited() {
        let def = StepDefinition::builder("x").concurrency_tag("").build();
        assert!(def.concurrency_tag().is_none());
        let def = StepDefinition::builder("x").concurrency_tag("probe").build();
        assert_eq!(def.concurrency_tag(), Some("probe"));
    }

    #[test]
    fn overrides_apply_only_set_fields() {
        let def = StepDefinition::builder("compress")
            .critical(false)
            .timeout(Duration::from_secs(600))
            .build();

        let o = StepOverride {
            enabled: Some(false),
            critical: None,
            timeout_secs: Some(30),
        };
        let over = def.overridden(&o);
        assert!(!over.enabled());
        assert!(!over.critical());
        assert_eq!(over.timeout(), Some(Duration::from_secs(30)));
        assert!(def.enabled());
    }
}
