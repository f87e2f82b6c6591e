//! Error taxonomy for pipeline runs.
//!
//! Fatal conditions are [`PipelineError`] values: they unwind straight to the
//! controller, which removes the workspace and reports the failed stage.
//! Non-fatal conditions are [`ChunkWarning`]s: they are accumulated in the run
//! state and never interrupt the current stage.

use crate::plan::Stage;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::io;
use thiserror::Error;

/// Convenience alias for results carrying a [`PipelineError`].
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A condition that aborts the whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required input is missing, unreadable, or malformed.
    #[error("[{stage}] input error: {message}")]
    FatalInput { stage: Stage, message: String },

    /// An input stream produced zero records.
    #[error("[{stage}] input `{source_name}` contains no records")]
    EmptyInput { stage: Stage, source_name: String },

    /// A non-chunked stage (preprocessing, assembly, mapping) produced nothing usable.
    #[error("[{stage}] stage failed: {message}")]
    FatalStage { stage: Stage, message: String },

    /// Every chunk of a stage was dropped.
    #[error("[{stage}] no chunk survived ({dropped} of {submitted} dropped)")]
    FatalEmptyResult {
        stage: Stage,
        submitted: usize,
        dropped: usize,
    },

    /// Sort/merge state is inconsistent with its input.
    #[error("[dedup] deduplication failed: {0}")]
    DedupFailure(String),

    /// The configuration was rejected before the run started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure while reading or writing run artifacts.
    #[error("[{stage}] I/O error while trying to {context}: {source}")]
    Io {
        stage: Stage,
        context: String,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// Build an [`PipelineError::Io`] with a short description of the failed action.
    pub fn io(stage: Stage, context: impl Into<String>, source: io::Error) -> Self {
        PipelineError::Io {
            stage,
            context: context.into(),
            source,
        }
    }

    /// The stage the error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::FatalInput { stage, .. }
            | PipelineError::EmptyInput { stage, .. }
            | PipelineError::FatalStage { stage, .. }
            | PipelineError::FatalEmptyResult { stage, .. }
            | PipelineError::Io { stage, .. } => Some(*stage),
            PipelineError::DedupFailure(_) => Some(Stage::Dedup),
            PipelineError::Config(_) => None,
        }
    }

    /// Process exit code for this failure. Success paths exit with 0.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::FatalInput { .. } | PipelineError::EmptyInput { .. } => 2,
            PipelineError::FatalStage { .. } => 3,
            PipelineError::FatalEmptyResult { .. } => 4,
            PipelineError::DedupFailure(_) => 5,
            PipelineError::Config(_) => 64,
            PipelineError::Io { .. } => 74,
        }
    }
}

/// Severity marker shown in the run log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Severity::Info => f.write_str("[INFO]"),
            Severity::Warning => f.write_str("[WARN]"),
            Severity::Fatal => f.write_str("[FATAL]"),
        }
    }
}

/// A non-fatal problem: a chunk that was dropped, or an enrichment that was not joined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkWarning {
    pub stage: Stage,
    /// `None` when the warning concerns a whole table rather than one chunk.
    pub chunk: Option<usize>,
    pub message: String,
}

impl ChunkWarning {
    pub fn chunk(stage: Stage, chunk: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            chunk: Some(chunk),
            message: message.into(),
        }
    }

    pub fn table(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            chunk: None,
            message: message.into(),
        }
    }
}

impl Display for ChunkWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self.chunk {
            Some(idx) => write!(f, "{} [{}] chunk {}: {}", Severity::Warning, self.stage, idx, self.message),
            None => write!(f, "{} [{}] {}", Severity::Warning, self.stage, self.message),
        }
    }
}
