//! Batch summary and process exit codes.

use std::fmt::Write as _;

use mf_pipeline::{PipelineRun, RunStatus, StepStatus};
use serde::Serialize;

/// Every file succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// Startup or configuration error; no file was processed.
pub const EXIT_STARTUP: i32 = 1;
/// At least one file finished partially and none failed.
pub const EXIT_PARTIAL: i32 = 2;
/// At least one file failed.
pub const EXIT_FAILED: i32 = 3;

/// Exit code for a finished batch.
pub fn exit_code(runs: &[PipelineRun]) -> i32 {
    if runs.iter().any(|r| r.status == RunStatus::Failed) {
        EXIT_FAILED
    } else if runs.iter().any(|r| r.status == RunStatus::Partial) {
        EXIT_PARTIAL
    } else {
        EXIT_SUCCESS
    }
}

/// Machine-readable digest of one run.
#[derive(Debug, Serialize)]
pub struct RunDigest<'a> {
    pub path: String,
    pub status: RunStatus,
    pub media_id: Option<&'a str>,
    pub duplicate: bool,
    pub failures: Vec<FailureDigest<'a>>,
}

#[derive(Debug, Serialize)]
pub struct FailureDigest<'a> {
    pub step: &'a str,
    pub kind: &'a str,
    pub message: &'a str,
    pub attempts: u32,
}

impl<'a> RunDigest<'a> {
    pub fn new(run: &'a PipelineRun) -> Self {
        let mut failures: Vec<FailureDigest<'a>> = run
            .failed_steps()
            .filter_map(|r| {
                r.error.as_ref().map(|e| FailureDigest {
                    step: &r.step,
                    kind: &e.kind,
                    message: &e.message,
                    attempts: r.attempts,
                })
            })
            .collect();
        if let Some(ref error) = run.error {
            failures.push(FailureDigest {
                step: "run",
                kind: "internal",
                message: error,
                attempts: 0,
            });
        }

        Self {
            path: run.path.display().to_string(),
            status: run.status,
            media_id: run.bag.text("store.media_id"),
            duplicate: run.bag.bool("dedup.is_duplicate").unwrap_or(false),
            failures,
        }
    }
}

/// Human-readable summary: one line per file, failed steps indented below.
pub fn render(runs: &[PipelineRun]) -> String {
    let mut out = String::new();
    let mut counts = [0usize; 3];

    for run in runs {
        let idx = match run.status {
            RunStatus::Success => 0,
            RunStatus::Partial => 1,
            RunStatus::Failed => 2,
        };
        counts[idx] += 1;

        let marker = match run.status {
            RunStatus::Success => "✓",
            RunStatus::Partial => "~",
            RunStatus::Failed => "✗",
        };
        let _ = write!(out, "{marker} {} [{}]", run.path.display(), run.status.as_str());
        if run.bag.bool("dedup.is_duplicate") == Some(true) {
            out.push_str(" (duplicate)");
        }
        out.push('\n');

        if let Some(ref error) = run.error {
            let _ = writeln!(out, "    run: {error}");
        }
        for step in &run.steps {
            match step.status {
                StepStatus::Failed => {
                    let message = step.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
                    let _ = writeln!(
                        out,
                        "    {}: {message} (attempts: {})",
                        step.step, step.attempts
                    );
                }
                StepStatus::Skipped if run.status != RunStatus::Success => {
                    if let Some(ref reason) = step.skip_reason {
                        let _ = writeln!(out, "    {}: skipped, {reason}", step.step);
                    }
                }
                _ => {}
            }
        }
    }

    let _ = writeln!(
        out,
        "\n{} files: {} succeeded, {} partial, {} failed",
        runs.len(),
        counts[0],
        counts[1],
        counts[2]
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::FileId;
    use std::path::PathBuf;

    fn run_with(status: RunStatus) -> PipelineRun {
        let mut run = PipelineRun::aborted(FileId::new(), PathBuf::from("/m/a.mov"), "boom");
        run.status = status;
        run.error = None;
        run
    }

    #[test]
    fn exit_code_precedence() {
        assert_eq!(exit_code(&[]), EXIT_SUCCESS);
        assert_eq!(exit_code(&[run_with(RunStatus::Success)]), EXIT_SUCCESS);
        assert_eq!(
            exit_code(&[run_with(RunStatus::Success), run_with(RunStatus::Partial)]),
            EXIT_PARTIAL
        );
        assert_eq!(
            exit_code(&[run_with(RunStatus::Partial), run_with(RunStatus::Failed)]),
            EXIT_FAILED
        );
    }

    #[test]
    fn render_lists_aborted_runs() {
        let run = PipelineRun::aborted(FileId::new(), PathBuf::from("/m/b.mov"), "file task panicked");
        let text = render(&[run, run_with(RunStatus::Success)]);
        assert!(text.contains("✗ /m/b.mov [failed]"));
        assert!(text.contains("run: file task panicked"));
        assert!(text.contains("2 files: 1 succeeded, 0 partial, 1 failed"));
    }

    #[test]
    fn digest_carries_run_error() {
        let run = PipelineRun::aborted(FileId::new(), PathBuf::from("/m/c.mov"), "join error");
        let digest = RunDigest::new(&run);
        assert_eq!(digest.failures.len(), 1);
        assert_eq!(digest.failures[0].message, "join error");
        assert!(!digest.duplicate);
    }
}
