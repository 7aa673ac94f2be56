//! Concrete record formats exchanged with external processes.
//!
//! - [`json_lines`]: one JSON document per line; the output schema is
//!   inferred from the first output line.
//! - [`arrow_ipc`]: an Arrow IPC stream of record batches; the stream's
//!   schema message is the probe element.

pub mod arrow_ipc;
pub mod json_lines;

use arrow::datatypes::Schema;

pub use arrow_ipc::{ArrowIpcInput, ArrowIpcOutput};
pub use json_lines::{JsonLinesInput, JsonLinesOutput};

/// Compact `name: Type` rendering used in schema mismatch reports.
pub fn describe_arrow_schema(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|field| format!("{}: {}", field.name(), field.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}
