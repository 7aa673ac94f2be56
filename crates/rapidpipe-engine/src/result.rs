//! Pipe operation result types.

use std::sync::Arc;

use crate::piper::PartitionResult;

/// A partition dropped under `skip_quarantined`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedPartition {
    pub partition: usize,
    pub exit_code: i32,
    pub location: String,
    pub records: u64,
}

/// Aggregate counts and timing for a pipe operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipeReport {
    pub partitions: usize,
    pub empty_partitions: usize,
    pub records_in: u64,
    pub records_out: u64,
    pub quarantined: Vec<QuarantinedPartition>,
    pub duration_secs: f64,
    pub parallelism: usize,
}

/// Table plus report returned by a successful pipe operation.
#[derive(Debug)]
pub struct PipeOutcome<S, R> {
    pub table: PipedTable<S, R>,
    pub report: PipeReport,
}

/// Output table of a pipe operation.
///
/// Partitions keep their input index; a skipped or empty partition is
/// present with no records. `schema` is `None` when no partition produced
/// output and no fallback schema was configured.
#[derive(Debug)]
pub struct PipedTable<S, R> {
    schema: Option<S>,
    materialized: Arc<Vec<PartitionResult<S, R>>>,
}

impl<S, R> PipedTable<S, R> {
    pub(crate) fn new(schema: Option<S>, materialized: Arc<Vec<PartitionResult<S, R>>>) -> Self {
        Self {
            schema,
            materialized,
        }
    }

    pub fn empty() -> Self {
        Self {
            schema: None,
            materialized: Arc::new(Vec::new()),
        }
    }

    pub fn schema(&self) -> Option<&S> {
        self.schema.as_ref()
    }

    pub fn num_partitions(&self) -> usize {
        self.materialized.len()
    }

    /// Records of partition `index`, schema stripped.
    pub fn partition(&self, index: usize) -> Option<&[R]> {
        self.materialized.get(index).map(|p| p.records.as_slice())
    }

    pub fn partitions(&self) -> impl Iterator<Item = &[R]> {
        self.materialized.iter().map(|p| p.records.as_slice())
    }

    /// All records, in partition order.
    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.partitions().flatten()
    }

    pub fn num_records(&self) -> usize {
        self.materialized.iter().map(|p| p.records.len()).sum()
    }
}

impl<S, R: Clone> PipedTable<S, R> {
    /// Take the records out of the table, cloning only if the
    /// materialized result is still cached.
    pub fn into_partitions(self) -> Vec<Vec<R>> {
        match Arc::try_unwrap(self.materialized) {
            Ok(results) => results.into_iter().map(|p| p.records).collect(),
            Err(shared) => shared.iter().map(|p| p.records.clone()).collect(),
        }
    }
}
