//! Quarantine record types.
//!
//! A [`QuarantineRecord`] is one original input record of a partition whose
//! subprocess failed, tagged with enough context for offline diagnosis.

use crate::error::FailureCategory;
use crate::ids::QuarantineLocation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO-8601 formatted timestamp string.
///
/// Thin wrapper providing type clarity without requiring a datetime
/// library dependency. No format validation; callers are trusted to
/// provide valid ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Create a new timestamp from an ISO-8601 string.
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Original input record of a failed partition, routed to quarantine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Destination table the record was appended to.
    pub location: QuarantineLocation,
    /// Index of the failed partition within its pipe operation.
    pub partition_index: u32,
    /// Position of the record within the partition's input.
    pub record_index: u32,
    /// JSON-serialized record content.
    pub record_json: String,
    /// Exit code of the failed subprocess.
    pub exit_code: i32,
    /// Human-readable failure description.
    pub error_message: String,
    /// Failure classification.
    pub error_category: FailureCategory,
    /// When the failure occurred.
    pub failed_at: Timestamp,
}
