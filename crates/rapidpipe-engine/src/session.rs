//! Pull-based pipe session over one partition.
//!
//! A [`PipeSession`] owns a started [`ProcessSession`] and the output
//! sequence bound over its stdout. Callers pull [`OutputElement`]s with
//! [`PipeSession::has_next`] / [`PipeSession::next_element`] or the
//! `Iterator` adapter. The end of output is coupled to process exit: the
//! session only reports exhaustion after the process exited zero and no
//! background unit failed.
//!
//! State machine: `Running -> {Exhausted, Failed}`. `Failed` is terminal
//! and re-raises the same error on every later call.

use std::sync::Arc;

use crate::command::PipeCommand;
use crate::errors::PipeError;
use crate::execution::CancelFlag;
use crate::formatter::{write_records, InputFormatter, OutputElement, OutputFormatter, OutputStream};
use crate::process::ProcessSession;
use crate::quarantine::{quarantine_partition, PartitionFailure, QuarantineTarget};

/// Element type yielded by a session.
pub type SessionElement<O> =
    OutputElement<<O as OutputFormatter>::Schema, <O as OutputFormatter>::Record>;

enum SessionState {
    Running,
    Exhausted,
    Failed(PipeError),
}

pub struct PipeSession<I: InputFormatter, O: OutputFormatter> {
    partition: usize,
    process: ProcessSession,
    output: OutputStream<O::Schema, O::Record>,
    records: Arc<Vec<I::Record>>,
    quarantine: Option<QuarantineTarget<I::Record>>,
    cancel: Option<CancelFlag>,
    buffered: Option<SessionElement<O>>,
    state: SessionState,
    failure_yielded: bool,
}

impl<I: InputFormatter, O: OutputFormatter> PipeSession<I, O> {
    /// Start the process for `partition` and bind `output` over its stdout.
    ///
    /// The writer unit writes `records` through `input` in order and
    /// always closes it. The same records are kept for quarantining.
    ///
    /// # Errors
    ///
    /// `ProcessSpawnFailed` if the command cannot be started.
    pub fn new(
        command: &PipeCommand,
        mut input: I,
        output: &O,
        quarantine: Option<QuarantineTarget<I::Record>>,
        partition: usize,
        records: Vec<I::Record>,
        cancel: Option<CancelFlag>,
    ) -> Result<Self, PipeError> {
        let records = Arc::new(records);
        let mut process = ProcessSession::new(command.clone(), format!("partition-{partition}"));

        let writer_records = Arc::clone(&records);
        let stdout = process.start(move |stdin| write_records(&mut input, stdin, &writer_records))?;
        if let (Some(cancel), Some(handle)) = (&cancel, process.kill_handle()) {
            cancel.register(handle);
        }

        tracing::debug!(
            partition,
            program = command.program(),
            records = records.len(),
            "Pipe session started"
        );

        Ok(Self {
            partition,
            process,
            output: output.make_iterator(stdout),
            records,
            quarantine,
            cancel,
            buffered: None,
            state: SessionState::Running,
            failure_yielded: false,
        })
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Exit code of the process, once it has been observed.
    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    /// Whether another element is available. Idempotent while an element
    /// is buffered.
    ///
    /// # Errors
    ///
    /// The session's failure; repeated on every later call.
    pub fn has_next(&mut self) -> Result<bool, PipeError> {
        match &self.state {
            SessionState::Failed(e) => return Err(e.clone()),
            SessionState::Exhausted => return Ok(false),
            SessionState::Running => {}
        }
        if self.buffered.is_some() {
            return Ok(true);
        }
        self.advance().inspect_err(|e| {
            self.state = SessionState::Failed(e.clone());
        })
    }

    /// Return the next element.
    ///
    /// # Errors
    ///
    /// The session's failure, or `InvalidState` once the output is exhausted.
    pub fn next_element(&mut self) -> Result<SessionElement<O>, PipeError> {
        if !self.has_next()? {
            return Err(self.exhausted());
        }
        self.buffered.take().ok_or_else(|| self.exhausted())
    }

    fn exhausted(&self) -> PipeError {
        PipeError::InvalidState(format!(
            "partition {}: output already exhausted",
            self.partition
        ))
    }

    fn advance(&mut self) -> Result<bool, PipeError> {
        self.check_cancelled()?;
        match self.output.next() {
            Some(Ok(element)) => {
                self.process.propagate_captured_failure()?;
                self.buffered = Some(element);
                Ok(true)
            }
            Some(Err(e)) => {
                self.check_cancelled()?;
                // Snapshot before killing: the kill itself breaks the stdin pipe.
                let captured = self.process.captured_failure();
                self.process.terminate();
                Err(match captured {
                    Some(failure) => PipeError::BackgroundUnitFailed(failure),
                    None => PipeError::OutputDecodeFailed {
                        partition: self.partition,
                        message: format!("{e:#}"),
                    },
                })
            }
            None => self.finish(),
        }
    }

    fn finish(&mut self) -> Result<bool, PipeError> {
        let exit_code = self.process.wait_for_exit()?;
        // A cancelled process is killed, not failed: never quarantine it.
        self.check_cancelled()?;
        if exit_code != 0 {
            let failure = PartitionFailure {
                partition: self.partition,
                exit_code,
                cause: self.process.captured_failure(),
                stderr_tail: self.process.stderr_tail(),
            };
            tracing::warn!(
                partition = self.partition,
                exit_code,
                reason = %failure.describe(),
                "Subprocess failed"
            );
            let quarantine =
                quarantine_partition(self.quarantine.as_ref(), &failure, &self.records);
            return Err(PipeError::SubprocessFailed {
                partition: self.partition,
                exit_code,
                cause: failure.cause,
                stderr_tail: failure.stderr_tail,
                quarantine,
            });
        }
        self.process.propagate_captured_failure()?;
        self.state = SessionState::Exhausted;
        Ok(false)
    }

    fn check_cancelled(&mut self) -> Result<(), PipeError> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            self.process.terminate();
            return Err(PipeError::Cancelled {
                partition: self.partition,
            });
        }
        Ok(())
    }
}

impl<I: InputFormatter, O: OutputFormatter> Iterator for PipeSession<I, O> {
    type Item = Result<SessionElement<O>, PipeError>;

    /// Yields a failure once, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.buffered.take().map(Ok),
            Ok(false) => None,
            Err(_) if self.failure_yielded => None,
            Err(e) => {
                self.failure_yielded = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{JsonLinesInput, JsonLinesOutput};
    use crate::process::{BackgroundUnit, ProcessStdin};
    use crate::quarantine::{QuarantineHandler, QuarantineOutcome};
    use rapidpipe_types::ids::QuarantineLocation;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    type JsonSession = PipeSession<JsonLinesInput, JsonLinesOutput>;

    fn sh(script: &str) -> PipeCommand {
        PipeCommand::new("sh").arg("-c").arg(script)
    }

    fn session(command: &PipeCommand, records: Vec<Value>) -> JsonSession {
        PipeSession::new(
            command,
            JsonLinesInput::default(),
            &JsonLinesOutput,
            None,
            0,
            records,
            None,
        )
        .unwrap()
    }

    fn records_of(elements: Vec<OutputElement<arrow::datatypes::SchemaRef, Value>>) -> Vec<Value> {
        elements
            .into_iter()
            .filter_map(|e| match e {
                OutputElement::Record(r) => Some(r),
                OutputElement::Schema(_) => None,
            })
            .collect()
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<(PartitionFailure, Vec<Value>)>>);

    impl QuarantineHandler<Value> for Capture {
        fn quarantine(
            &self,
            failure: &PartitionFailure,
            records: &[Value],
            _location: &QuarantineLocation,
        ) -> anyhow::Result<u64> {
            self.0
                .lock()
                .unwrap()
                .push((failure.clone(), records.to_vec()));
            Ok(records.len() as u64)
        }
    }

    #[test]
    fn cat_passes_records_through_schema_first() {
        let cmd = PipeCommand::new("cat");
        let elements: Vec<_> = session(&cmd, vec![json!(1), json!(2), json!(3)])
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(matches!(elements[0], OutputElement::Schema(_)));
        assert_eq!(records_of(elements), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn has_next_is_idempotent() {
        let cmd = PipeCommand::new("cat");
        let mut s = session(&cmd, vec![json!({"a": 1})]);
        assert!(s.has_next().unwrap());
        assert!(s.has_next().unwrap());
        assert!(matches!(s.next_element().unwrap(), OutputElement::Schema(_)));
        assert!(s.has_next().unwrap());
        assert_eq!(s.next_element().unwrap(), OutputElement::Record(json!({"a": 1})));
        assert!(!s.has_next().unwrap());
        assert!(!s.has_next().unwrap());
        assert_eq!(s.exit_code(), Some(0));
        assert!(matches!(s.next_element(), Err(PipeError::InvalidState(_))));
    }

    #[test]
    fn non_zero_exit_fails_without_records() {
        let cmd = sh("echo boom >&2; exit 2");
        let mut s = session(&cmd, vec![json!(1), json!(2), json!(3)]);
        let err = s.has_next().unwrap_err();
        match &err {
            PipeError::SubprocessFailed {
                exit_code,
                stderr_tail,
                quarantine,
                ..
            } => {
                assert_eq!(*exit_code, 2);
                assert_eq!(stderr_tail, &["boom"]);
                assert_eq!(quarantine, &QuarantineOutcome::NotConfigured);
            }
            other => panic!("expected SubprocessFailed, got {other:?}"),
        }
        assert!(!err.is_quarantined());
        // Failed is terminal and re-raises the same error.
        assert_eq!(s.has_next().unwrap_err().to_string(), err.to_string());
        assert_eq!(s.next_element().unwrap_err().to_string(), err.to_string());
    }

    #[test]
    fn iterator_yields_failure_once() {
        let cmd = sh("cat >/dev/null; exit 3");
        let mut s = session(&cmd, vec![json!(1)]);
        assert!(matches!(s.next(), Some(Err(PipeError::SubprocessFailed { .. }))));
        assert!(s.next().is_none());
        assert!(s.next().is_none());
    }

    #[test]
    fn quarantine_receives_exactly_the_partition_records() {
        let capture = Arc::new(Capture::default());
        let target = QuarantineTarget::new(
            capture.clone() as Arc<dyn QuarantineHandler<Value>>,
            QuarantineLocation::new("q.events"),
        );
        let records = vec![json!(1), json!(2), json!(3)];
        let mut s: JsonSession = PipeSession::new(
            &sh("echo boom >&2; exit 2"),
            JsonLinesInput::default(),
            &JsonLinesOutput,
            Some(target),
            5,
            records.clone(),
            None,
        )
        .unwrap();

        let err = s.has_next().unwrap_err();
        assert!(err.is_quarantined(), "got {err}");
        assert!(err.to_string().contains("quarantined 3 records"));

        let calls = capture.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.partition, 5);
        assert_eq!(calls[0].0.exit_code, 2);
        assert_eq!(calls[0].1, records);
    }

    #[test]
    fn successful_exit_does_not_quarantine() {
        let capture = Arc::new(Capture::default());
        let target = QuarantineTarget::new(
            capture.clone() as Arc<dyn QuarantineHandler<Value>>,
            QuarantineLocation::new("q.events"),
        );
        let s: JsonSession = PipeSession::new(
            &PipeCommand::new("cat"),
            JsonLinesInput::default(),
            &JsonLinesOutput,
            Some(target),
            0,
            vec![json!(1)],
            None,
        )
        .unwrap();
        assert_eq!(s.count(), 2);
        assert!(capture.0.lock().unwrap().is_empty());
    }

    #[test]
    fn undecodable_output_is_decode_failure() {
        let cmd = sh("cat >/dev/null; echo not-json");
        let mut s = session(&cmd, vec![json!(1)]);
        assert!(matches!(
            s.has_next(),
            Err(PipeError::OutputDecodeFailed { partition: 0, .. })
        ));
    }

    #[derive(Clone, Default)]
    struct FailingInput(Option<Arc<Mutex<ProcessStdin>>>);

    impl InputFormatter for FailingInput {
        type Record = Value;

        fn init(&mut self, stdin: ProcessStdin) -> anyhow::Result<()> {
            self.0 = Some(Arc::new(Mutex::new(stdin)));
            Ok(())
        }

        fn write(&mut self, _record: &Value) -> anyhow::Result<()> {
            anyhow::bail!("unsupported record")
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.0 = None;
            Ok(())
        }
    }

    #[test]
    fn writer_failure_beats_successful_exit() {
        let mut s: PipeSession<FailingInput, JsonLinesOutput> = PipeSession::new(
            &PipeCommand::new("cat"),
            FailingInput::default(),
            &JsonLinesOutput,
            None,
            0,
            vec![json!(1)],
            None,
        )
        .unwrap();
        match s.has_next() {
            Err(PipeError::BackgroundUnitFailed(failure)) => {
                assert_eq!(failure.unit, BackgroundUnit::InputWriter);
                assert!(failure.message.contains("unsupported record"));
            }
            other => panic!("expected BackgroundUnitFailed, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_session_fails_with_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut s: JsonSession = PipeSession::new(
            &PipeCommand::new("cat"),
            JsonLinesInput::default(),
            &JsonLinesOutput,
            None,
            7,
            vec![json!(1)],
            Some(cancel),
        )
        .unwrap();
        assert!(matches!(
            s.has_next(),
            Err(PipeError::Cancelled { partition: 7 })
        ));
    }

    #[test]
    fn cancel_releases_session_blocked_on_silent_process() {
        let capture = Arc::new(Capture::default());
        let target = QuarantineTarget::new(
            capture.clone() as Arc<dyn QuarantineHandler<Value>>,
            QuarantineLocation::new("q.events"),
        );
        let cancel = CancelFlag::new();
        let mut s: JsonSession = PipeSession::new(
            &sh("exec sleep 30"),
            JsonLinesInput::default(),
            &JsonLinesOutput,
            Some(target),
            4,
            vec![json!(1)],
            Some(cancel.clone()),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            cancel.cancel();
        });
        assert!(matches!(
            s.has_next(),
            Err(PipeError::Cancelled { partition: 4 })
        ));
        canceller.join().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        // Killed by cancellation, so nothing is quarantined.
        assert!(capture.0.lock().unwrap().is_empty());
    }

    struct Broken;

    impl QuarantineHandler<Value> for Broken {
        fn quarantine(
            &self,
            _failure: &PartitionFailure,
            _records: &[Value],
            _location: &QuarantineLocation,
        ) -> anyhow::Result<u64> {
            anyhow::bail!("quarantine table is read-only")
        }
    }

    #[test]
    fn quarantine_failure_keeps_subprocess_failure_primary() {
        let target = QuarantineTarget::new(
            Arc::new(Broken) as Arc<dyn QuarantineHandler<Value>>,
            QuarantineLocation::new("q.events"),
        );
        let mut s: JsonSession = PipeSession::new(
            &sh("cat >/dev/null; exit 5"),
            JsonLinesInput::default(),
            &JsonLinesOutput,
            Some(target),
            1,
            vec![json!(1), json!(2)],
            None,
        )
        .unwrap();

        let err = s.has_next().unwrap_err();
        match &err {
            PipeError::SubprocessFailed {
                partition,
                exit_code,
                quarantine: QuarantineOutcome::Failed { location, message },
                ..
            } => {
                assert_eq!(*partition, 1);
                assert_eq!(*exit_code, 5);
                assert_eq!(location, "q.events");
                assert!(message.contains("read-only"), "got {message}");
            }
            other => panic!("expected SubprocessFailed with failed quarantine, got {other:?}"),
        }
        assert!(!err.is_quarantined());
        assert_eq!(s.has_next().unwrap_err().to_string(), err.to_string());
    }

    #[test]
    fn missing_program_fails_to_construct() {
        let result: Result<JsonSession, _> = PipeSession::new(
            &PipeCommand::new("/nonexistent/rapidpipe-test-binary"),
            JsonLinesInput::default(),
            &JsonLinesOutput,
            None,
            0,
            vec![json!(1)],
            None,
        );
        assert!(matches!(result, Err(PipeError::ProcessSpawnFailed { .. })));
    }
}
