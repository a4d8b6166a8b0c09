//! Step registry and execution order.
//!
//! Steps are registered explicitly with their definitions. Dependencies are
//! resolved lazily: [`StepRegistry::build`] validates every edge, rejects
//! cycles and produces an [`ExecutionOrder`] once, before any file is
//! touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use mf_core::config::StepOverride;
use mf_core::{Error, Result};

use crate::step::{Step, StepDefinition};

struct Entry {
    def: StepDefinition,
    step: Arc<dyn Step>,
}

/// All registered steps, in registration order.
#[derive(Default)]
pub struct StepRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its definition's name.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateStep`] if the name is already taken.
    pub fn register(&mut self, def: StepDefinition, step: impl Step + 'static) -> Result<()> {
        self.register_arc(def, Arc::new(step))
    }

    /// [`register`](Self::register) for an already shared step.
    pub fn register_arc(&mut self, def: StepDefinition, step: Arc<dyn Step>) -> Result<()> {
        if self.index.contains_key(def.name()) {
            return Err(Error::DuplicateStep(def.name().to_string()));
        }
        self.index.insert(def.name().to_string(), self.entries.len());
        self.entries.push(Entry { def, step });
        Ok(())
    }

    /// Definition of the named step.
    pub fn get(&self, name: &str) -> Result<&StepDefinition> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i].def)
            .ok_or_else(|| Error::UnknownStep(name.to_string()))
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.def.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply per-step `enabled` / `critical` / `timeout` overrides.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownStep`] for an override naming an unregistered step;
    /// no override is applied in that case.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, StepOverride>) -> Result<()> {
        if let Some(unknown) = overrides.keys().find(|name| !self.index.contains_key(*name)) {
            return Err(Error::UnknownStep(unknown.clone()));
        }
        for (name, o) in overrides {
            let i = self.index[name];
            self.entries[i].def = self.entries[i].def.overridden(o);
        }
        Ok(())
    }

    /// Validate the graph and compute the execution order.
    ///
    /// Ties between steps that become ready together are broken by
    /// registration order, so the result is deterministic. Disabled steps
    /// stay in the order (the executor records them as skipped) and the
    /// enabled subsequence is itself a valid topological order.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDependency`] for an edge to an unregistered step,
    /// [`Error::CyclicDependency`] naming one cycle otherwise.
    pub fn build(&self) -> Result<ExecutionOrder> {
        let n = self.entries.len();
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(n);
        for entry in &self.entries {
            let mut resolved = Vec::with_capacity(entry.def.depends_on().len());
            for dep in entry.def.depends_on() {
                let &j = self.index.get(dep).ok_or_else(|| Error::InvalidDependency {
                    step: entry.def.name().to_string(),
                    dependency: dep.clone(),
                })?;
                resolved.push(j);
            }
            deps.push(resolved);
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < n {
            return Err(Error::CyclicDependency {
                cycle: self.find_cycle(&deps, &pending),
            });
        }

        let steps: Vec<PlannedStep> = order
            .into_iter()
            .map(|i| PlannedStep {
                def: self.entries[i].def.clone(),
                step: Arc::clone(&self.entries[i].step),
            })
            .collect();
        Ok(ExecutionOrder {
            steps: Arc::from(steps),
        })
    }

    /// Walk unresolved dependencies from the first stuck step until a name
    /// repeats. Every stuck step has at least one stuck dependency, so the
    /// walk always closes a loop.
    fn find_cycle(&self, deps: &[Vec<usize>], pending: &[usize]) -> Vec<String> {
        let stuck = |i: usize| pending[i] > 0;
        let Some(start) = (0..deps.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(&next) = deps[current].iter().find(|&&d| stuck(d)) else {
                break;
            };
            if let Some(&pos) = seen.get(&next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.entries[i].def.name().to_string())
                    .collect();
                cycle.push(self.entries[next].def.name().to_string());
                return cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }

        path.iter()
            .map(|&i| self.entries[i].def.name().to_string())
            .collect()
    }
}

/// A step in its final position.
#[derive(Clone)]
pub struct PlannedStep {
    pub def: StepDefinition,
    pub step: Arc<dyn Step>,
}

impl std::fmt::Debug for PlannedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedStep")
            .field("def", &self.def)
            .finish_non_exhaustive()
    }
}

/// Validated, topologically ordered steps. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionOrder {
    steps: Arc<[PlannedStep]>,
}

impl ExecutionOrder {
    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    /// All step names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.def.name()).collect()
    }

    /// Enabled step names in execution order.
    pub fn enabled_names(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.def.enabled())
            .map(|s| s.def.name())
            .collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.def.name() == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
