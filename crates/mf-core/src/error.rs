//! Unified error type for the mediaflow pipeline.
//!
//! All crates funnel their failures into [`Error`]. Registry-time variants are
//! fatal at startup; runtime variants are caught at the executor boundary and
//! classified via [`Error::is_transient`] to decide whether a retry is allowed.

use std::fmt;
use std::time::Duration;

/// Unified error type covering all failure modes in mediaflow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // -- Registry-time -------------------------------------------------------
    /// A step with the same name was already registered.
    #[error("Duplicate step: {0}")]
    DuplicateStep(String),

    /// A step depends on a name that was never registered.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    InvalidDependency {
        /// The step declaring the dependency.
        step: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The step graph contains a cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Step names along the cycle; the first name is repeated at the end.
        cycle: Vec<String>,
    },

    /// Lookup of a step that does not exist.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    // -- Per-step runtime ----------------------------------------------------
    /// A step exceeded its declared maximum duration.
    #[error("Step '{step}' timed out after {after:?}")]
    StepTimeout {
        /// The step that timed out.
        step: String,
        /// The limit that was exceeded.
        after: Duration,
    },

    /// Transcoding failed; carries the underlying codec message.
    #[error("Compression error: {0}")]
    Compression(String),

    /// A metadata extraction tool failed.
    #[error("Extraction error [{tool}]: {message}")]
    Extraction {
        /// Name of the extraction tool (e.g. "ffprobe").
        tool: String,
        /// The tool's diagnostic text.
        message: String,
    },

    /// The AI analysis service failed or returned a payload that does not
    /// match the declared schema.
    #[error("Analysis error: {message}")]
    Analysis {
        /// Human-readable error description.
        message: String,
        /// Whether the failure is network/rate-limit related.
        transient: bool,
    },

    /// A declared required upstream field is absent from the data bag.
    #[error("Step '{step}' is missing required input '{field}'")]
    MissingRequiredInput {
        /// The step that declared the requirement.
        step: String,
        /// Fully-qualified field key, e.g. `compress.output_path`.
        field: String,
    },

    /// The run was cancelled before the step could start.
    #[error("Cancelled")]
    Cancelled,

    // -- Infrastructure ------------------------------------------------------
    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) could not be located or run.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Configuration or input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry of the failing operation may succeed.
    ///
    /// Only network and rate-limit failures qualify. Schema, codec, timeout
    /// and missing-input errors are permanent for the current input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Analysis { transient: true, .. })
    }

    /// Whether this error is raised while building the step registry.
    pub fn is_registry_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateStep(_)
                | Error::InvalidDependency { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownStep(_)
        )
    }

    /// Short, stable label for summaries and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DuplicateStep(_) => "duplicate_step",
            Error::InvalidDependency { .. } => "invalid_dependency",
            Error::CyclicDependency { .. } => "cyclic_dependency",
            Error::UnknownStep(_) => "unknown_step",
            Error::StepTimeout { .. } => "step_timeout",
            Error::Compression(_) => "compression",
            Error::Extraction { .. } => "extraction",
            Error::Analysis { .. } => "analysis",
            Error::MissingRequiredInput { .. } => "missing_required_input",
            Error::Cancelled => "cancelled",
            Error::Database { .. } => "database",
            Error::Io { .. } => "io",
            Error::Tool { .. } => "tool",
            Error::Validation(_) => "validation",
            Error::Internal(_) => "internal",
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Extraction`].
    pub fn extraction(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Extraction {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// A non-retryable analysis failure (bad request, schema mismatch).
    pub fn analysis(message: impl fmt::Display) -> Self {
        Error::Analysis {
            message: message.to_string(),
            transient: false,
        }
    }

    /// A retryable analysis failure (connection reset, 429, 5xx).
    pub fn analysis_transient(message: impl fmt::Display) -> Self {
        Error::Analysis {
            message: message.to_string(),
            transient: true,
        }
    }

    /// Convenience constructor for [`Error::MissingRequiredInput`].
    pub fn missing_input(step: impl Into<String>, field: impl Into<String>) -> Self {
        Error::MissingRequiredInput {
            step: step.into(),
            field: field.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
