//! Per-partition entry point and output framing.

use crate::command::PipeCommand;
use crate::errors::PipeError;
use crate::execution::CancelFlag;
use crate::formatter::{InputFormatter, OutputElement, OutputFormatter};
use crate::quarantine::QuarantineTarget;
use crate::session::{PipeSession, SessionElement};

/// Everything needed to pipe one partition; built once per operation and
/// cloned into each partition task.
pub struct PartitionPiper<I: InputFormatter, O: OutputFormatter> {
    command: PipeCommand,
    input: I,
    output: O,
    quarantine: Option<QuarantineTarget<I::Record>>,
}

impl<I: InputFormatter, O: OutputFormatter> Clone for PartitionPiper<I, O> {
    fn clone(&self) -> Self {
        Self {
            command: self.command.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            quarantine: self.quarantine.clone(),
        }
    }
}

impl<I: InputFormatter, O: OutputFormatter> PartitionPiper<I, O> {
    pub fn new(command: PipeCommand, input: I, output: O) -> Self {
        Self {
            command,
            input,
            output,
            quarantine: None,
        }
    }

    #[must_use]
    pub fn with_quarantine(mut self, target: QuarantineTarget<I::Record>) -> Self {
        self.quarantine = Some(target);
        self
    }

    pub fn command(&self) -> &PipeCommand {
        &self.command
    }

    pub fn output_formatter(&self) -> &O {
        &self.output
    }

    pub fn has_quarantine(&self) -> bool {
        self.quarantine.is_some()
    }

    /// Pipe one partition. An empty partition starts no process.
    ///
    /// # Errors
    ///
    /// `ProcessSpawnFailed` if the process cannot be started.
    pub fn pipe(
        &self,
        partition: usize,
        records: Vec<I::Record>,
        cancel: Option<CancelFlag>,
    ) -> Result<PartitionOutput<I, O>, PipeError> {
        if records.is_empty() {
            tracing::debug!(partition, "Empty partition, no subprocess started");
            return Ok(PartitionOutput::Empty);
        }
        PipeSession::new(
            &self.command,
            self.input.clone(),
            &self.output,
            self.quarantine.clone(),
            partition,
            records,
            cancel,
        )
        .map(PartitionOutput::Session)
    }
}

/// Output of one partition: schema first, then records.
pub enum PartitionOutput<I: InputFormatter, O: OutputFormatter> {
    Empty,
    Session(PipeSession<I, O>),
}

impl<I: InputFormatter, O: OutputFormatter> Iterator for PartitionOutput<I, O> {
    type Item = Result<SessionElement<O>, PipeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Empty => None,
            Self::Session(session) => session.next(),
        }
    }
}

/// Materialized output of one partition.
///
/// `schema` is `None` only when the partition produced no output at all.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResult<S, R> {
    pub schema: Option<S>,
    pub records: Vec<R>,
}

impl<S, R> PartitionResult<S, R> {
    pub fn empty() -> Self {
        Self {
            schema: None,
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.schema.is_none()
    }
}

/// Drain `output` into a [`PartitionResult`], enforcing schema-then-records
/// framing.
///
/// # Errors
///
/// The first failure of `output`, or `FramingViolation` if a record arrives
/// before the schema or a second schema arrives.
pub fn collect_partition<S, R>(
    partition: usize,
    output: impl IntoIterator<Item = Result<OutputElement<S, R>, PipeError>>,
) -> Result<PartitionResult<S, R>, PipeError> {
    let mut result = PartitionResult::empty();
    for element in output {
        match element? {
            OutputElement::Schema(schema) => {
                if result.schema.is_some() {
                    return Err(PipeError::FramingViolation {
                        partition,
                        message: "second schema element".to_string(),
                    });
                }
                result.schema = Some(schema);
            }
            OutputElement::Record(record) => {
                if result.schema.is_none() {
                    return Err(PipeError::FramingViolation {
                        partition,
                        message: "record before schema".to_string(),
                    });
                }
                result.records.push(record);
            }
        }
    }
    Ok(result)
}
