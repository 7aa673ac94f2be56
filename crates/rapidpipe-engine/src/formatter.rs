//! Record formatter capabilities used to talk to the external process.
//!
//! An [`InputFormatter`] serializes partition records onto the process's
//! stdin. An [`OutputFormatter`] turns the process's stdout into a lazy
//! sequence of [`OutputElement`]s: one schema probe element first, then
//! records.

use std::fmt::Debug;

use crate::process::{ProcessStdin, ProcessStdout};

/// One element of a pipe session's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputElement<S, R> {
    /// Schema probe; always the first element of a non-empty stream.
    Schema(S),
    Record(R),
}

/// Lazy, finite, non-restartable output sequence.
pub type OutputStream<S, R> = Box<dyn Iterator<Item = anyhow::Result<OutputElement<S, R>>> + Send>;

/// Serializes records onto a process's stdin.
///
/// One value is built per pipe operation and cloned for every partition.
/// The session calls `init` once, `write` once per record in partition
/// order, and `close` exactly once, even when `init` or a `write` failed.
pub trait InputFormatter: Clone + Send + 'static {
    type Record: Send + Sync + 'static;

    /// Take ownership of the stdin stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream preamble cannot be written.
    fn init(&mut self, stdin: ProcessStdin) -> anyhow::Result<()>;

    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    fn write(&mut self, record: &Self::Record) -> anyhow::Result<()>;

    /// Flush and release the stdin stream so the process observes EOF.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Deserializes a process's stdout into a schema followed by records.
pub trait OutputFormatter: Clone + Send + Sync + 'static {
    type Schema: Clone + PartialEq + Debug + Send + Sync + 'static;
    type Record: Send + Sync + 'static;

    /// Bind a lazy output sequence over `stdout`. Reading happens on the
    /// caller's thread as the sequence is pulled.
    fn make_iterator(&self, stdout: ProcessStdout) -> OutputStream<Self::Schema, Self::Record>;

    /// Human-readable schema rendering for mismatch reports.
    fn describe_schema(&self, schema: &Self::Schema) -> String {
        format!("{schema:?}")
    }
}

/// Write every record through `formatter`, releasing it on all paths.
///
/// The first failure wins: a write error is reported even if `close`
/// also fails afterwards.
pub(crate) fn write_records<F: InputFormatter>(
    formatter: &mut F,
    stdin: ProcessStdin,
    records: &[F::Record],
) -> anyhow::Result<()> {
    let written = formatter
        .init(stdin)
        .and_then(|()| records.iter().try_for_each(|record| formatter.write(record)));
    let closed = formatter.close();
    written.and(closed)
}
