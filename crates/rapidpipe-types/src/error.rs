//! Failure classification shared by the engine, the quarantine store, and the CLI.
//!
//! [`FailureCategory`] is the operator-facing label attached to quarantined
//! rows and printed in run summaries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a pipe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The external command could not be started.
    Spawn,
    /// The external command ran and exited non-zero.
    Subprocess,
    /// The stdin writer or stderr drainer failed.
    BackgroundUnit,
    /// Partitions disagreed on the output schema.
    Schema,
    /// Output could not be decoded or broke schema-then-records framing.
    Output,
    /// The partition was cancelled before it finished.
    Cancelled,
    /// Host-side failure (task panics, invalid call order).
    Internal,
}

impl FailureCategory {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Subprocess => "subprocess",
            Self::BackgroundUnit => "background_unit",
            Self::Schema => "schema",
            Self::Output => "output",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Parse the storage form produced by [`FailureCategory::as_str`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let category = match raw {
            "spawn" => Self::Spawn,
            "subprocess" => Self::Subprocess,
            "background_unit" => Self::BackgroundUnit,
            "schema" => Self::Schema,
            "output" => Self::Output,
            "cancelled" => Self::Cancelled,
            "internal" => Self::Internal,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
