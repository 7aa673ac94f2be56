//! Pipe error model.

use std::sync::Arc;

use rapidpipe_types::error::FailureCategory;

use crate::process::BackgroundFailure;
use crate::quarantine::QuarantineOutcome;

/// Number of stderr lines quoted in a `SubprocessFailed` message.
const STDERR_LINES_IN_MESSAGE: usize = 3;

// ---------------------------------------------------------------------------
// PipeError: categorised failures of a pipe operation
// ---------------------------------------------------------------------------

/// Categorized pipe failure.
///
/// `Clone` so a failed [`PipeSession`](crate::session::PipeSession) can
/// re-raise the same failure on every later call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipeError {
    /// The external command could not be started (missing binary, permission).
    #[error("failed to spawn `{program}`: {message}")]
    ProcessSpawnFailed {
        program: String,
        kind: std::io::ErrorKind,
        message: String,
    },

    /// The external command ran and exited non-zero.
    #[error(
        "partition {partition}: subprocess exited with code {exit_code}{}",
        describe_subprocess_failure(.cause.as_ref(), .stderr_tail, .quarantine)
    )]
    SubprocessFailed {
        partition: usize,
        exit_code: i32,
        cause: Option<BackgroundFailure>,
        stderr_tail: Vec<String>,
        quarantine: QuarantineOutcome,
    },

    /// The stdin writer or stderr drainer failed, so the exchanged data is not trustworthy.
    #[error("{0}")]
    BackgroundUnitFailed(BackgroundFailure),

    /// Partitions produced more than one distinct output schema.
    #[error(
        "partitions produced {} distinct output schemas: {}",
        .schemas.len(),
        .schemas.join(" | ")
    )]
    SchemaMismatch { schemas: Vec<String> },

    /// An operation was invoked before the step it depends on.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The output formatter raised while reading subprocess stdout.
    #[error("partition {partition}: failed to read subprocess output: {message}")]
    OutputDecodeFailed { partition: usize, message: String },

    /// Output did not follow the schema-then-records framing.
    #[error("partition {partition}: malformed output framing: {message}")]
    FramingViolation { partition: usize, message: String },

    /// The partition was cancelled by the orchestrator.
    #[error("partition {partition}: cancelled")]
    Cancelled { partition: usize },

    /// Host-side failure (task panics, join errors, thread spawn failures).
    #[error("{0:#}")]
    Infrastructure(Arc<anyhow::Error>),
}

fn describe_subprocess_failure(
    cause: Option<&BackgroundFailure>,
    stderr_tail: &[String],
    quarantine: &QuarantineOutcome,
) -> String {
    let mut out = String::new();
    if let Some(cause) = cause {
        out.push_str(&format!("; {cause}"));
    }
    if !stderr_tail.is_empty() {
        let start = stderr_tail.len().saturating_sub(STDERR_LINES_IN_MESSAGE);
        out.push_str(&format!("; stderr: {}", stderr_tail[start..].join(" / ")));
    }
    match quarantine {
        QuarantineOutcome::NotConfigured => {}
        QuarantineOutcome::Quarantined { location, records } => {
            out.push_str(&format!(" (quarantined {records} records to `{location}`)"));
        }
        QuarantineOutcome::Failed { location, message } => {
            out.push_str(&format!(" (quarantine to `{location}` failed: {message})"));
        }
    }
    out
}

impl From<anyhow::Error> for PipeError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(Arc::new(e))
    }
}

impl PipeError {
    /// Returns `true` if the failed partition's records were durably quarantined.
    pub fn is_quarantined(&self) -> bool {
        matches!(
            self,
            Self::SubprocessFailed {
                quarantine: QuarantineOutcome::Quarantined { .. },
                ..
            }
        )
    }

    /// Partition the failure belongs to, when it is partition-scoped.
    pub fn partition(&self) -> Option<usize> {
        match self {
            Self::SubprocessFailed { partition, .. }
            | Self::OutputDecodeFailed { partition, .. }
            | Self::FramingViolation { partition, .. }
            | Self::Cancelled { partition } => Some(*partition),
            _ => None,
        }
    }

    /// Exit code of the failed subprocess, if the process ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::SubprocessFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Operator-facing classification.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::ProcessSpawnFailed { .. } => FailureCategory::Spawn,
            Self::SubprocessFailed { .. } => FailureCategory::Subprocess,
            Self::BackgroundUnitFailed(_) => FailureCategory::BackgroundUnit,
            Self::SchemaMismatch { .. } => FailureCategory::Schema,
            Self::OutputDecodeFailed { .. } | Self::FramingViolation { .. } => {
                FailureCategory::Output
            }
            Self::Cancelled { .. } => FailureCategory::Cancelled,
            Self::InvalidState(_) | Self::Infrastructure(_) => FailureCategory::Internal,
        }
    }
}
