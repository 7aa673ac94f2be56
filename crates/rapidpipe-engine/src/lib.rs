//! Pipe partitions of records through external subprocesses.
//!
//! | Module         | Responsibility |
//! |----------------|----------------|
//! | `process`      | One external process plus its stdin writer and stderr drainer units |
//! | `session`      | Pull-based schema-then-records output of one partition |
//! | `piper`        | Per-partition entry point and output framing |
//! | `orchestrator` | Parallel partitions, schema reconciliation, output table |
//! | `quarantine`   | Best-effort routing of failed partitions' input records |
//! | `cache`        | Registry of materialized results per execution context |
//! | `formats`      | JSON lines and Arrow IPC record formats |
//! | `config`       | Pipe YAML parsing and validation |

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_panics_doc)]

pub mod cache;
pub mod command;
pub mod config;
pub mod errors;
pub mod execution;
pub mod formats;
pub mod formatter;
pub mod orchestrator;
pub mod piper;
pub mod process;
pub mod quarantine;
pub mod result;
pub mod session;

pub use cache::{CacheRegistry, ContextId, ExecutionContext};
pub use command::PipeCommand;
pub use errors::PipeError;
pub use execution::{CancelFlag, PartitionFailurePolicy, PartitionedInput, PipeOptions};
pub use formatter::{InputFormatter, OutputElement, OutputFormatter};
pub use orchestrator::PipeOrchestrator;
pub use piper::{collect_partition, PartitionOutput, PartitionPiper, PartitionResult};
pub use process::{BackgroundFailure, BackgroundUnit, KillHandle, ProcessSession};
pub use quarantine::{
    NoopQuarantine, PartitionFailure, QuarantineHandler, QuarantineOutcome, QuarantinePayload,
    QuarantineTarget, StoreQuarantine,
};
pub use result::{PipeOutcome, PipeReport, PipedTable, QuarantinedPartition};
pub use session::PipeSession;
