//! JSON lines format: one compact JSON document per line in both directions.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use serde_json::Value;

use crate::formatter::{InputFormatter, OutputElement, OutputFormatter, OutputStream};
use crate::process::{ProcessStdin, ProcessStdout};

/// Field name used when the probe line is a scalar rather than an object.
pub const SCALAR_FIELD: &str = "value";

/// Writes each record as one line of compact JSON.
#[derive(Default)]
pub struct JsonLinesInput {
    out: Option<ProcessStdin>,
}

impl Clone for JsonLinesInput {
    /// Clones are unbound; each partition binds its own stdin.
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl InputFormatter for JsonLinesInput {
    type Record = Value;

    fn init(&mut self, stdin: ProcessStdin) -> Result<()> {
        self.out = Some(stdin);
        Ok(())
    }

    fn write(&mut self, record: &Value) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .context("JSON lines writer used before init")?;
        serde_json::to_writer(&mut *out, record).context("failed to encode JSON record")?;
        out.write_all(b"\n").context("failed to write to subprocess stdin")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush().context("failed to flush subprocess stdin")?;
        }
        Ok(())
    }
}

/// Reads one JSON document per line; the first line is the schema probe.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesOutput;

impl OutputFormatter for JsonLinesOutput {
    type Schema = SchemaRef;
    type Record = Value;

    fn make_iterator(&self, stdout: ProcessStdout) -> OutputStream<SchemaRef, Value> {
        Box::new(JsonLinesStream {
            reader: stdout,
            line: String::new(),
            line_no: 0,
            probed: false,
            pending: None,
            done: false,
        })
    }

    fn describe_schema(&self, schema: &SchemaRef) -> String {
        super::describe_arrow_schema(schema)
    }
}

struct JsonLinesStream {
    reader: ProcessStdout,
    line: String,
    line_no: u64,
    probed: bool,
    pending: Option<Value>,
    done: bool,
}

impl JsonLinesStream {
    fn next_value(&mut self) -> Option<Result<Value>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    let trimmed = self.line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let line_no = self.line_no;
                    return Some(
                        serde_json::from_str(trimmed)
                            .with_context(|| format!("invalid JSON on output line {line_no}")),
                    );
                }
                Err(e) => return Some(Err(e).context("failed to read subprocess stdout")),
            }
        }
    }
}

impl Iterator for JsonLinesStream {
    type Item = Result<OutputElement<SchemaRef, Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.pending.take() {
            return Some(Ok(OutputElement::Record(record)));
        }
        if self.done {
            return None;
        }
        let value = match self.next_value()? {
            Ok(value) => value,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if self.probed {
            return Some(Ok(OutputElement::Record(value)));
        }
        self.probed = true;
        let schema = infer_schema(&value);
        self.pending = Some(value);
        Some(Ok(OutputElement::Schema(schema)))
    }
}

/// Infer an Arrow schema from one probe document.
///
/// Objects yield one nullable field per key (sorted by key); any other
/// value yields a single [`SCALAR_FIELD`] field.
pub fn infer_schema(probe: &Value) -> SchemaRef {
    let fields: Vec<Field> = match probe {
        Value::Object(map) => map
            .iter()
            .map(|(name, value)| Field::new(name, infer_type(value), true))
            .collect(),
        other => vec![Field::new(SCALAR_FIELD, infer_type(other), true)],
    };
    Arc::new(Schema::new(fields))
}

fn infer_type(value: &Value) -> DataType {
    match value {
        Value::Null => DataType::Null,
        Value::Bool(_) => DataType::Boolean,
        Value::Number(n) if n.is_i64() => DataType::Int64,
        Value::Number(n) if n.is_u64() => DataType::UInt64,
        Value::Number(_) => DataType::Float64,
        Value::String(_) => DataType::Utf8,
        Value::Array(items) => {
            let item = items.first().map_or(DataType::Null, infer_type);
            DataType::List(Arc::new(Field::new("item", item, true)))
        }
        Value::Object(map) => DataType::Struct(
            map.iter()
                .map(|(name, value)| Field::new(name, infer_type(value), true))
                .collect::<Fields>(),
        ),
    }
}
