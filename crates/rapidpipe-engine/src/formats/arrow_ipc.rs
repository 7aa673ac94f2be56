//! Arrow IPC stream format. Each partition is written as one IPC stream of
//! record batches; the process answers with one IPC stream on stdout.

use std::io::{BufRead, Read, Write};

use anyhow::{Context, Result};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::formatter::{InputFormatter, OutputElement, OutputFormatter, OutputStream};
use crate::process::{ProcessStdin, ProcessStdout};

/// Writes record batches as a single IPC stream.
///
/// The stream header is taken from the first batch, so a partition's
/// batches must share one schema.
#[derive(Default)]
pub struct ArrowIpcInput {
    stdin: Option<ProcessStdin>,
    writer: Option<StreamWriter<ProcessStdin>>,
}

impl Clone for ArrowIpcInput {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl InputFormatter for ArrowIpcInput {
    type Record = RecordBatch;

    fn init(&mut self, stdin: ProcessStdin) -> Result<()> {
        self.stdin = Some(stdin);
        Ok(())
    }

    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if self.writer.is_none() {
            let stdin = self
                .stdin
                .take()
                .context("Arrow IPC writer used before init")?;
            let writer = StreamWriter::try_new(stdin, batch.schema().as_ref())
                .context("Failed to create Arrow IPC StreamWriter")?;
            self.writer = Some(writer);
        }
        let writer = self
            .writer
            .as_mut()
            .context("Arrow IPC writer missing after init")?;
        writer
            .write(batch)
            .context("Failed to write RecordBatch to subprocess stdin")
    }

    fn close(&mut self) -> Result<()> {
        self.stdin = None;
        if let Some(writer) = self.writer.take() {
            let mut stdin = writer
                .into_inner()
                .context("Failed to finish IPC stream")?;
            stdin.flush().context("failed to flush subprocess stdin")?;
        }
        Ok(())
    }
}

/// Reads one IPC stream from stdout. Empty stdout is an empty stream.
#[derive(Debug, Clone, Default)]
pub struct ArrowIpcOutput;

impl OutputFormatter for ArrowIpcOutput {
    type Schema = SchemaRef;
    type Record = RecordBatch;

    fn make_iterator(&self, stdout: ProcessStdout) -> OutputStream<SchemaRef, RecordBatch> {
        Box::new(IpcStream::Pending(stdout))
    }

    fn describe_schema(&self, schema: &SchemaRef) -> String {
        super::describe_arrow_schema(schema)
    }
}

type BatchReader = Box<dyn Iterator<Item = Result<RecordBatch, ArrowError>> + Send>;

enum IpcStream {
    /// Stream header not read yet.
    Pending(ProcessStdout),
    Reading(BatchReader),
    Done,
}

impl Iterator for IpcStream {
    type Item = Result<OutputElement<SchemaRef, RecordBatch>>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(self, IpcStream::Done) {
            IpcStream::Pending(mut stdout) => {
                match stdout.fill_buf() {
                    Ok(buf) if buf.is_empty() => return None,
                    Ok(_) => {}
                    Err(e) => {
                        return Some(Err(e).context("failed to read subprocess stdout"));
                    }
                }
                match StreamReader::try_new(stdout, None) {
                    Ok(reader) => {
                        let schema = reader.schema();
                        *self = IpcStream::Reading(Box::new(reader));
                        Some(Ok(OutputElement::Schema(schema)))
                    }
                    Err(e) => Some(
                        Err(e).context("Failed to read Arrow IPC schema from subprocess stdout"),
                    ),
                }
            }
            IpcStream::Reading(mut reader) => match reader.next()? {
                Ok(batch) => {
                    *self = IpcStream::Reading(reader);
                    Some(Ok(OutputElement::Record(batch)))
                }
                Err(e) => Some(Err(e).context("Failed to read RecordBatch from IPC stream")),
            },
            IpcStream::Done => None,
        }
    }
}

/// Read every batch of an IPC stream, e.g. a CLI input file.
///
/// # Errors
///
/// Returns an error if the stream header or any batch fails to decode.
pub fn read_ipc_batches(reader: impl Read) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let reader =
        StreamReader::try_new(reader, None).context("Failed to create Arrow IPC StreamReader")?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read RecordBatch from IPC stream")?;
    Ok((schema, batches))
}

/// Write `batches` as one IPC stream with `schema` as its header.
///
/// # Errors
///
/// Returns an error if encoding or the underlying writer fails.
pub fn write_ipc_batches(writer: impl Write, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<()> {
    let mut writer = StreamWriter::try_new(writer, schema.as_ref())
        .context("Failed to create Arrow IPC StreamWriter")?;
    for batch in batches {
        writer
            .write(batch)
            .context("Failed to write RecordBatch to IPC")?;
    }
    writer
        .into_inner()
        .context("Failed to finish IPC stream")?
        .flush()
        .context("Failed to flush IPC stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn batch(ids: &[i64], names: &[&str]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(names.to_vec())),
            ],
        )
        .unwrap()
    }

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn input_stream_is_readable_as_output() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let mut input = ArrowIpcInput::default();
        input.init(Box::new(buf.clone())).unwrap();
        input.write(&batch(&[1, 2], &["a", "b"])).unwrap();
        input.write(&batch(&[3], &["c"])).unwrap();
        input.close().unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let out: Vec<_> = ArrowIpcOutput
            .make_iterator(Box::new(Cursor::new(bytes)))
            .map(Result::unwrap)
            .collect();
        assert_eq!(out.len(), 3);
        let OutputElement::Schema(schema) = &out[0] else {
            panic!("expected schema first");
        };
        assert_eq!(super::super::describe_arrow_schema(schema), "id: Int64, name: Utf8");
        let OutputElement::Record(last) = &out[2] else {
            panic!("expected record");
        };
        let names = last.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(0), "c");
    }

    #[test]
    fn empty_stdout_is_empty_stream() {
        let mut stream = ArrowIpcOutput.make_iterator(Box::new(Cursor::new(Vec::new())));
        assert!(stream.next().is_none());
    }

    #[test]
    fn garbage_stdout_fails_once() {
        let out: Vec<_> = ArrowIpcOutput
            .make_iterator(Box::new(Cursor::new(b"not arrow at all".to_vec())))
            .collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }

    #[test]
    fn file_helpers_roundtrip() {
        let original = batch(&[7, 8, 9], &["x", "y", "z"]);
        let mut bytes = Vec::new();
        write_ipc_batches(&mut bytes, &original.schema(), &[original.clone()]).unwrap();
        let (schema, batches) = read_ipc_batches(Cursor::new(bytes)).unwrap();
        assert_eq!(schema, original.schema());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 3);
        assert_eq!(batches[0].column(0).len(), 3);
    }

    #[test]
    fn close_without_batches_writes_nothing() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let mut input = ArrowIpcInput::default();
        input.init(Box::new(buf.clone())).unwrap();
        input.close().unwrap();
        assert!(buf.0.lock().unwrap().is_empty());
    }
}
