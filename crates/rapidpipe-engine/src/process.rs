//! One external process and its three standard streams.
//!
//! ```text
//!                 ┌──────────────┐
//!  writer thread ─▶ stdin        │
//!                 │   process    │ stdout ─▶ consumer (caller thread)
//!  drain thread  ◀─ stderr       │
//!                 └──────────────┘
//!        │                │
//!        └── FailureCell ◀┘  (first failure wins, read by the consumer)
//! ```
//!
//! Stdin writing and stderr draining run on their own threads so a process
//! that fills its stdout buffer while waiting on stdin never stalls against
//! a consumer that is itself blocked on a full stdin pipe.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ChildStderr, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;

use crate::command::PipeCommand;
use crate::errors::PipeError;

/// Writable stdin handle handed to the input-writer unit.
pub type ProcessStdin = Box<dyn Write + Send>;

/// Buffered stdout handle consumed by the caller.
pub type ProcessStdout = Box<dyn BufRead + Send>;

const STDOUT_BUFFER_BYTES: usize = 64 * 1024;
const STDIN_BUFFER_BYTES: usize = 64 * 1024;

/// Most recent stderr lines kept for failure diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;

/// Interval between exit checks while waiting for a process.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// Background failure capture
// ---------------------------------------------------------------------------

/// Background execution unit of a process session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundUnit {
    InputWriter,
    StderrDrainer,
}

impl std::fmt::Display for BackgroundUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputWriter => f.write_str("input writer"),
            Self::StderrDrainer => f.write_str("stderr drainer"),
        }
    }
}

/// Failure raised by a background unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundFailure {
    pub unit: BackgroundUnit,
    pub message: String,
}

impl BackgroundFailure {
    pub fn new(unit: BackgroundUnit, message: impl Into<String>) -> Self {
        Self {
            unit,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BackgroundFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.unit, self.message)
    }
}

/// Single-slot failure cell shared by the background units of one session.
///
/// The first recorded failure wins; later ones are dropped.
#[derive(Debug, Clone, Default)]
pub struct FailureCell(Arc<OnceLock<BackgroundFailure>>);

impl FailureCell {
    /// Record `failure` unless a failure was already captured.
    /// Returns `true` if this call stored it.
    pub fn record(&self, failure: BackgroundFailure) -> bool {
        match self.0.set(failure) {
            Ok(()) => true,
            Err(dropped) => {
                tracing::debug!(
                    unit = %dropped.unit,
                    error = %dropped.message,
                    "Secondary background failure dropped"
                );
                false
            }
        }
    }

    pub fn get(&self) -> Option<&BackgroundFailure> {
        self.0.get()
    }
}

// ---------------------------------------------------------------------------
// ProcessSession
// ---------------------------------------------------------------------------

type StderrTail = Arc<Mutex<VecDeque<String>>>;
type SharedChild = Arc<Mutex<Child>>;

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kills a session's process from another thread.
///
/// Holds the process weakly: once the session is dropped, `kill` is a no-op.
#[derive(Debug, Clone)]
pub struct KillHandle {
    label: Arc<str>,
    child: Weak<Mutex<Child>>,
}

impl KillHandle {
    /// Best-effort kill. Returns `true` if a running process was signalled.
    pub fn kill(&self) -> bool {
        let Some(child) = self.child.upgrade() else {
            return false;
        };
        let mut child = lock_child(&child);
        if matches!(child.try_wait(), Ok(Some(_))) {
            return false;
        }
        match child.kill() {
            Ok(()) => {
                tracing::debug!(process = %self.label, "Killed subprocess on cancellation");
                true
            }
            Err(e) => {
                tracing::debug!(process = %self.label, error = %e, "Kill failed");
                false
            }
        }
    }

    /// Whether the owning session still exists.
    pub fn is_live(&self) -> bool {
        self.child.strong_count() > 0
    }
}

/// Owns exactly one external process.
///
/// Created by [`ProcessSession::new`], spawned by [`ProcessSession::start`].
/// Dropping a session whose process is still running kills and reaps it.
pub struct ProcessSession {
    command: PipeCommand,
    label: String,
    child: Option<SharedChild>,
    exit_code: Option<i32>,
    failure: FailureCell,
    stderr_tail: StderrTail,
    units: Vec<JoinHandle<()>>,
}

impl ProcessSession {
    /// Create an unstarted session. `label` names the unit threads and log lines.
    pub fn new(command: PipeCommand, label: impl Into<String>) -> Self {
        Self {
            command,
            label: label.into(),
            child: None,
            exit_code: None,
            failure: FailureCell::default(),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            units: Vec::with_capacity(2),
        }
    }

    /// Spawn the process, the input-writer unit running `writer`, and the
    /// stderr-drainer unit. Returns the process's buffered stdout.
    ///
    /// `writer` owns stdin; the handle is closed when `writer` returns,
    /// fails, or panics. Its failure is captured, never rethrown.
    ///
    /// # Errors
    ///
    /// `ProcessSpawnFailed` if the command cannot be started, `InvalidState`
    /// if the session was already started.
    pub fn start<F>(&mut self, writer: F) -> Result<ProcessStdout, PipeError>
    where
        F: FnOnce(ProcessStdin) -> anyhow::Result<()> + Send + 'static,
    {
        if self.child.is_some() {
            return Err(PipeError::InvalidState(format!(
                "{}: process already started",
                self.label
            )));
        }

        let mut child = self
            .command
            .to_process_command()
            .spawn()
            .map_err(|e| PipeError::ProcessSpawnFailed {
                program: self.command.program().to_string(),
                kind: e.kind(),
                message: e.to_string(),
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipeError::InvalidState(format!(
                "{}: subprocess streams were not piped",
                self.label
            )));
        };

        tracing::debug!(
            process = %self.label,
            pid = child.id(),
            command = %self.command,
            "Spawned subprocess"
        );
        self.child = Some(Arc::new(Mutex::new(child)));

        let writer_unit = spawn_unit(
            format!("{}-stdin", self.label),
            BackgroundUnit::InputWriter,
            self.failure.clone(),
            move || writer(Box::new(BufWriter::with_capacity(STDIN_BUFFER_BYTES, stdin))),
        );
        self.track_unit(writer_unit)?;

        let label = self.label.clone();
        let tail = Arc::clone(&self.stderr_tail);
        let drain_unit = spawn_unit(
            format!("{}-stderr", self.label),
            BackgroundUnit::StderrDrainer,
            self.failure.clone(),
            move || drain_stderr(stderr, &label, &tail),
        );
        self.track_unit(drain_unit)?;

        Ok(Box::new(BufReader::with_capacity(STDOUT_BUFFER_BYTES, stdout)))
    }

    fn track_unit(&mut self, spawned: std::io::Result<JoinHandle<()>>) -> Result<(), PipeError> {
        match spawned {
            Ok(handle) => {
                self.units.push(handle);
                Ok(())
            }
            Err(e) => {
                self.terminate();
                Err(anyhow::Error::new(e)
                    .context(format!("{}: failed to spawn background unit", self.label))
                    .into())
            }
        }
    }

    /// Block until the process exits, then join both background units so
    /// the failure cell is final. Repeated calls return the same code.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the process was never started.
    pub fn wait_for_exit(&mut self) -> Result<i32, PipeError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let child = self.child.as_ref().ok_or_else(|| {
            PipeError::InvalidState("wait_for_exit called before start".to_string())
        })?;

        // Poll instead of blocking in `wait` so a KillHandle can take the lock.
        let status = loop {
            let polled = lock_child(child)
                .try_wait()
                .with_context(|| format!("{}: waiting for subprocess", self.label))?;
            match polled {
                Some(status) => break status,
                None => thread::sleep(EXIT_POLL_INTERVAL),
            }
        };
        self.join_units();

        let code = exit_code(status);
        self.exit_code = Some(code);
        tracing::debug!(process = %self.label, exit_code = code, "Subprocess exited");
        Ok(code)
    }

    fn join_units(&mut self) {
        for handle in self.units.drain(..) {
            if handle.join().is_err() {
                tracing::error!(process = %self.label, "Background unit thread aborted");
            }
        }
    }

    /// If a background unit failed, kill the process and return that failure.
    ///
    /// # Errors
    ///
    /// `BackgroundUnitFailed` carrying the captured failure.
    pub fn propagate_captured_failure(&mut self) -> Result<(), PipeError> {
        match self.failure.get().cloned() {
            Some(failure) => {
                self.terminate();
                Err(PipeError::BackgroundUnitFailed(failure))
            }
            None => Ok(()),
        }
    }

    /// Non-destructive read of the failure cell.
    pub fn captured_failure(&self) -> Option<BackgroundFailure> {
        self.failure.get().cloned()
    }

    /// Handle for killing the process from another thread; `None` before start.
    pub fn kill_handle(&self) -> Option<KillHandle> {
        self.child.as_ref().map(|child| KillHandle {
            label: Arc::from(self.label.as_str()),
            child: Arc::downgrade(child),
        })
    }

    /// Most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Best-effort kill of a running process. No-op once it has exited.
    pub fn terminate(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        if let Some(child) = self.child.as_ref() {
            match lock_child(child).kill() {
                Ok(()) => tracing::debug!(process = %self.label, "Killed subprocess"),
                Err(e) => tracing::debug!(process = %self.label, error = %e, "Kill failed"),
            }
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        if let Some(child) = self.child.as_ref() {
            let mut child = lock_child(child);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn spawn_unit<F>(
    name: String,
    unit: BackgroundUnit,
    failure: FailureCell,
    body: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    thread::Builder::new().name(name).spawn(move || {
        let message = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        tracing::debug!(unit = %unit, error = %message, "Background unit failed");
        failure.record(BackgroundFailure::new(unit, message));
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

fn drain_stderr(stderr: ChildStderr, label: &str, tail: &Mutex<VecDeque<String>>) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .context("reading subprocess stderr")?;
        if n == 0 {
            return Ok(());
        }
        let raw = String::from_utf8_lossy(&buf);
        let line = raw.trim_end_matches(['\n', '\r']);
        tracing::warn!(process = label, stderr = line, "Subprocess stderr");

        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}

/// Exit code, or `128 + signal` for a signal-terminated process.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
