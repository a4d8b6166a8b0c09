//! Batch runner: a fixed pool of in-flight files over one executor.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use mf_core::FileId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::bag::DataBag;
use crate::executor::{panic_message, PipelineExecutor, PipelineRun, RunStatus};

/// Running totals for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
}

impl RunProgress {
    fn record(&mut self, status: RunStatus) {
        self.completed += 1;
        match status {
            RunStatus::Success => self.succeeded += 1,
            RunStatus::Partial => self.partial += 1,
            RunStatus::Failed => self.failed += 1,
        }
    }
}

/// Drives many files through a shared [`PipelineExecutor`].
///
/// At most `workers` files are in flight. Each file gets a child of the
/// batch's cancellation token, so cancelling the batch stops every file while
/// one file's cancellation never reaches its siblings.
///
/// Bag paths named as scratch fields are deleted once a file's run is
/// terminal; the values stay in the returned bag.
pub struct RunCoordinator {
    executor: Arc<PipelineExecutor>,
    workers: usize,
    progress: Arc<Mutex<RunProgress>>,
    scratch_fields: Arc<[String]>,
}

impl RunCoordinator {
    /// `workers` of zero is treated as one.
    pub fn new(executor: PipelineExecutor, workers: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            workers: workers.max(1),
            progress: Arc::new(Mutex::new(RunProgress::default())),
            scratch_fields: Arc::from(Vec::new()),
        }
    }

    /// Delete the files under these bag keys after each run.
    pub fn with_scratch_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scratch_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn scratch_fields(&self) -> &[String] {
        &self.scratch_fields
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Snapshot of the current batch's counts.
    pub fn progress(&self) -> RunProgress {
        *self.progress.lock()
    }

    /// Run every file, returning results in completion order once the pool
    /// has drained.
    pub async fn run_all<I, P>(&self, files: I, cancel: &CancellationToken) -> Vec<PipelineRun>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut pending = files.into_iter().map(Into::<PathBuf>::into);
        let total = pending.size_hint().0;
        *self.progress.lock() = RunProgress {
            total,
            ..RunProgress::default()
        };

        let mut tasks: JoinSet<PipelineRun> = JoinSet::new();
        let mut origins: HashMap<task::Id, (FileId, PathBuf)> = HashMap::new();
        let mut runs = Vec::with_capacity(total);
        let mut submitted = 0usize;

        loop {
            while tasks.len() < self.workers {
                let Some(path) = pending.next() else { break };
                submitted += 1;
                let file_id = FileId::new();
                let handle = tasks.spawn(self.file_task(file_id, path.clone(), cancel.child_token()));
                origins.insert(handle.id(), (file_id, path));
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let run = settle(joined, &mut origins);

            {
                let mut progress = self.progress.lock();
                progress.total = progress.total.max(submitted);
                progress.record(run.status);
            }
            runs.push(run);
        }

        let progress = self.progress();
        tracing::info!(
            total = progress.completed,
            succeeded = progress.succeeded,
            partial = progress.partial,
            failed = progress.failed,
            "Batch finished"
        );
        runs
    }

    fn file_task(
        &self,
        file_id: FileId,
        path: PathBuf,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = PipelineRun> + Send + 'static {
        let executor = Arc::clone(&self.executor);
        let scratch = Arc::clone(&self.scratch_fields);
        async move {
            let fut = executor.run(file_id, path.clone(), DataBag::new(), &cancel);
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(run) => {
                    remove_scratch(&run, &scratch).await;
                    run
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(file_id = %file_id, path = %path.display(), "File run panicked: {message}");
                    PipelineRun::aborted(file_id, path, format!("run panicked: {message}"))
                }
            }
        }
    }
}

async fn remove_scratch(run: &PipelineRun, fields: &[String]) {
    for field in fields {
        let Some(path) = run.bag.path(field) else { continue };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!(file_id = %run.file_id, field = %field, path = %path.display(), "Removed scratch file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file_id = %run.file_id, path = %path.display(), "Failed to remove scratch file: {e}");
            }
        }
    }
}

/// Turn a joined file task into its run, keeping the file's identity when the
/// task itself died. The task body catches panics, so a join error means the
/// runtime aborted the task.
fn settle(
    joined: Result<(task::Id, PipelineRun), JoinError>,
    origins: &mut HashMap<task::Id, (FileId, PathBuf)>,
) -> PipelineRun {
    match joined {
        Ok((id, run)) => {
            origins.remove(&id);
            run
        }
        Err(e) => {
            let (file_id, path) = origins.remove(&e.id()).unwrap_or_else(|| (FileId::new(), PathBuf::new()));
            tracing::error!(file_id = %file_id, path = %path.display(), "File task failed to join: {e}");
            PipelineRun::aborted(file_id, path, format!("file task join error: {e}"))
        }
    }
}
