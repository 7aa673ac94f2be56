//! Runtime options for one pipe operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::process::KillHandle;

/// Records of every partition, in partition order.
pub type PartitionedInput<R> = Vec<Vec<R>>;

/// Upper bound for `parallelism: auto`.
pub const MAX_AUTO_PARALLELISM: usize = 16;

/// What the orchestrator does when a partition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFailurePolicy {
    /// Fail the operation and cancel sibling partitions.
    #[default]
    Abort,
    /// Drop partitions whose records were quarantined; abort on anything else.
    SkipQuarantined,
}

/// Runtime execution options (the resolved form of the pipe YAML's runtime keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Maximum partitions piped concurrently.
    pub parallelism: usize,
    pub on_partition_failure: PartitionFailurePolicy,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            parallelism: auto_parallelism(),
            on_partition_failure: PartitionFailurePolicy::default(),
        }
    }
}

/// Available cores, capped at [`MAX_AUTO_PARALLELISM`].
pub fn auto_parallelism() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .min(MAX_AUTO_PARALLELISM)
}

/// Shared cancellation signal for the partitions of one operation.
///
/// Sessions register a [`KillHandle`] for their process; `cancel` sets the
/// flag and kills every registered process, so a partition blocked on a
/// silent subprocess is released too.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<CancelState>);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    processes: Mutex<Vec<KillHandle>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and kill every registered process.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let processes = std::mem::take(&mut *self.processes());
        let killed = processes.iter().filter(|handle| handle.kill()).count();
        if killed > 0 {
            tracing::debug!(killed, "Cancelled running subprocesses");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Track a process for cancellation. A process registered after
    /// `cancel` is killed immediately.
    pub fn register(&self, handle: KillHandle) {
        {
            let mut processes = self.processes();
            processes.retain(KillHandle::is_live);
            processes.push(handle.clone());
        }
        // `cancel` sets the flag before taking the list, so either it sees
        // this handle or this check sees the flag.
        if self.is_cancelled() {
            handle.kill();
        }
    }

    fn processes(&self) -> MutexGuard<'_, Vec<KillHandle>> {
        self.0.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Split `records` into `partitions` contiguous chunks whose sizes differ
/// by at most one. Order is preserved; trailing chunks may be empty.
pub fn partition_evenly<R>(records: Vec<R>, partitions: usize) -> PartitionedInput<R> {
    let partitions = partitions.max(1);
    let base = records.len() / partitions;
    let extra = records.len() % partitions;

    let mut iter = records.into_iter();
    (0..partitions)
        .map(|i| {
            let size = base + usize::from(i < extra);
            iter.by_ref().take(size).collect()
        })
        .collect()
}
