//! Quarantine of failed partitions.
//!
//! When a partition's subprocess exits non-zero and a [`QuarantineTarget`]
//! is configured, the partition's original records are handed to a
//! [`QuarantineHandler`]. Quarantining is best effort: a handler failure is
//! logged and reported on the primary error, never replacing it.

use std::sync::Arc;

use anyhow::Context;
use arrow::record_batch::RecordBatch;
use rapidpipe_state::QuarantineStore;
use rapidpipe_types::error::FailureCategory;
use rapidpipe_types::ids::{PipeId, QuarantineLocation};
use rapidpipe_types::quarantine::{QuarantineRecord, Timestamp};

use crate::process::BackgroundFailure;

/// Context handed to a handler alongside the failed partition's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub partition: usize,
    pub exit_code: i32,
    pub cause: Option<BackgroundFailure>,
    pub stderr_tail: Vec<String>,
}

impl PartitionFailure {
    /// One-line description: the captured cause, or the stderr tail.
    pub fn describe(&self) -> String {
        let reason = match (&self.cause, self.stderr_tail.last()) {
            (Some(cause), _) => cause.to_string(),
            (None, Some(line)) => format!("unknown cause; last stderr line: {line}"),
            (None, None) => "unknown cause".to_string(),
        };
        format!("exit code {}: {reason}", self.exit_code)
    }
}

/// Result of the quarantine step for one failed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineOutcome {
    NotConfigured,
    Quarantined { location: String, records: u64 },
    Failed { location: String, message: String },
}

/// Durably appends the original records of a failed partition.
pub trait QuarantineHandler<R>: Send + Sync {
    /// Append one entry per record to `location`. Returns the count appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the records could not be durably appended.
    fn quarantine(
        &self,
        failure: &PartitionFailure,
        records: &[R],
        location: &QuarantineLocation,
    ) -> anyhow::Result<u64>;
}

/// Handler that discards records, counting them as quarantined.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQuarantine;

impl<R> QuarantineHandler<R> for NoopQuarantine {
    fn quarantine(
        &self,
        _failure: &PartitionFailure,
        records: &[R],
        _location: &QuarantineLocation,
    ) -> anyhow::Result<u64> {
        Ok(records.len() as u64)
    }
}

/// Record types that can be stored in quarantine as JSON text.
pub trait QuarantinePayload {
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded.
    fn to_quarantine_json(&self) -> anyhow::Result<String>;
}

impl QuarantinePayload for serde_json::Value {
    fn to_quarantine_json(&self) -> anyhow::Result<String> {
        Ok(self.to_string())
    }
}

impl QuarantinePayload for i64 {
    fn to_quarantine_json(&self) -> anyhow::Result<String> {
        Ok(self.to_string())
    }
}

impl QuarantinePayload for String {
    fn to_quarantine_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("failed to encode string record")
    }
}

impl QuarantinePayload for RecordBatch {
    /// Rows of the batch as a JSON array of objects.
    fn to_quarantine_json(&self) -> anyhow::Result<String> {
        let mut writer = arrow::json::ArrayWriter::new(Vec::new());
        writer
            .write(self)
            .context("failed to encode RecordBatch as JSON")?;
        writer.finish().context("failed to finish JSON array")?;
        String::from_utf8(writer.into_inner()).context("JSON writer produced invalid UTF-8")
    }
}

/// Handler backed by a [`QuarantineStore`].
#[derive(Clone)]
pub struct StoreQuarantine {
    store: Arc<dyn QuarantineStore>,
    pipe: PipeId,
}

impl StoreQuarantine {
    pub fn new(store: Arc<dyn QuarantineStore>, pipe: PipeId) -> Self {
        Self { store, pipe }
    }
}

impl<R: QuarantinePayload> QuarantineHandler<R> for StoreQuarantine {
    fn quarantine(
        &self,
        failure: &PartitionFailure,
        records: &[R],
        location: &QuarantineLocation,
    ) -> anyhow::Result<u64> {
        let failed_at = Timestamp::new(chrono::Utc::now().to_rfc3339());
        let error_message = failure.describe();
        let error_category = match failure.cause {
            Some(_) => FailureCategory::BackgroundUnit,
            None => FailureCategory::Subprocess,
        };
        let partition_index =
            u32::try_from(failure.partition).context("partition index exceeds u32")?;

        let rows = records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                Ok(QuarantineRecord {
                    location: location.clone(),
                    partition_index,
                    record_index: u32::try_from(i).context("record index exceeds u32")?,
                    record_json: record.to_quarantine_json()?,
                    exit_code: failure.exit_code,
                    error_message: error_message.clone(),
                    error_category,
                    failed_at: failed_at.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.store
            .append(&self.pipe, &rows)
            .with_context(|| format!("failed to append quarantine records to `{location}`"))
    }
}

/// Handler plus destination; present only when quarantining is configured.
pub struct QuarantineTarget<R> {
    pub handler: Arc<dyn QuarantineHandler<R>>,
    pub location: QuarantineLocation,
}

impl<R> QuarantineTarget<R> {
    pub fn new(handler: Arc<dyn QuarantineHandler<R>>, location: QuarantineLocation) -> Self {
        Self { handler, location }
    }
}

impl<R> Clone for QuarantineTarget<R> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            location: self.location.clone(),
        }
    }
}

impl<R> std::fmt::Debug for QuarantineTarget<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarantineTarget")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Run the handler for a failed partition, logging the result.
pub(crate) fn quarantine_partition<R>(
    target: Option<&QuarantineTarget<R>>,
    failure: &PartitionFailure,
    records: &[R],
) -> QuarantineOutcome {
    let Some(target) = target else {
        return QuarantineOutcome::NotConfigured;
    };
    let location = target.location.as_str().to_string();

    match target.handler.quarantine(failure, records, &target.location) {
        Ok(count) => {
            tracing::info!(
                partition = failure.partition,
                exit_code = failure.exit_code,
                location = %location,
                records = count,
                "Quarantined records of failed partition"
            );
            QuarantineOutcome::Quarantined {
                location,
                records: count,
            }
        }
        Err(e) => {
            tracing::error!(
                partition = failure.partition,
                exit_code = failure.exit_code,
                location = %location,
                record_count = records.len(),
                error = %format!("{e:#}"),
                "Failed to quarantine records of failed partition"
            );
            QuarantineOutcome::Failed {
                location,
                message: format!("{e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::BackgroundUnit;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use rapidpipe_state::SqliteQuarantineStore;
    use serde_json::json;

    fn failure(cause: Option<BackgroundFailure>) -> PartitionFailure {
        PartitionFailure {
            partition: 1,
            exit_code: 2,
            cause,
            stderr_tail: vec!["boom".into()],
        }
    }

    struct Broken;

    impl QuarantineHandler<i64> for Broken {
        fn quarantine(
            &self,
            _failure: &PartitionFailure,
            _records: &[i64],
            _location: &QuarantineLocation,
        ) -> anyhow::Result<u64> {
            anyhow::bail!("table is read-only")
        }
    }

    #[test]
    fn describe_prefers_captured_cause() {
        assert_eq!(
            failure(None).describe(),
            "exit code 2: unknown cause; last stderr line: boom"
        );
        let cause = BackgroundFailure::new(BackgroundUnit::InputWriter, "broken pipe");
        assert_eq!(
            failure(Some(cause)).describe(),
            "exit code 2: input writer failed: broken pipe"
        );
    }

    #[test]
    fn missing_target_is_not_configured() {
        let outcome = quarantine_partition::<i64>(None, &failure(None), &[1, 2]);
        assert_eq!(outcome, QuarantineOutcome::NotConfigured);
    }

    #[test]
    fn handler_error_becomes_failed_outcome() {
        let target: QuarantineTarget<i64> =
            QuarantineTarget::new(Arc::new(Broken), QuarantineLocation::new("q.events"));
        let outcome = quarantine_partition(Some(&target), &failure(None), &[1, 2]);
        assert_eq!(
            outcome,
            QuarantineOutcome::Failed {
                location: "q.events".into(),
                message: "table is read-only".into(),
            }
        );
    }

    #[test]
    fn store_handler_appends_one_row_per_record() {
        let store = Arc::new(SqliteQuarantineStore::in_memory().unwrap());
        let handler = StoreQuarantine::new(store.clone(), PipeId::new("enrich"));
        let target: QuarantineTarget<serde_json::Value> =
            QuarantineTarget::new(Arc::new(handler), QuarantineLocation::new("q.events"));
        let records = vec![json!({"id": 1}), json!({"id": 2}), json!("three")];

        let outcome = quarantine_partition(Some(&target), &failure(None), &records);
        assert_eq!(
            outcome,
            QuarantineOutcome::Quarantined {
                location: "q.events".into(),
                records: 3,
            }
        );

        let rows = store.load(&QuarantineLocation::new("q.events")).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].record_json, r#"{"id":1}"#);
        assert_eq!(rows[2].record_json, r#""three""#);
        assert_eq!(rows[2].record_index, 2);
        assert_eq!(rows[0].partition_index, 1);
        assert_eq!(rows[0].exit_code, 2);
        assert_eq!(rows[0].error_category, FailureCategory::Subprocess);
    }

    #[test]
    fn record_batch_payload_is_json_rows() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))]).unwrap();
        assert_eq!(batch.to_quarantine_json().unwrap(), r#"[{"id":1},{"id":2}]"#);
        assert_eq!("a\"b".to_string().to_quarantine_json().unwrap(), r#""a\"b""#);
        assert_eq!(7_i64.to_quarantine_json().unwrap(), "7");
    }

    #[test]
    fn noop_counts_records() {
        let n = QuarantineHandler::<i64>::quarantine(
            &NoopQuarantine,
            &failure(None),
            &[1, 2, 3],
            &QuarantineLocation::new("nowhere"),
        )
        .unwrap();
        assert_eq!(n, 3);
    }
}
