//! External program invocation shared by every partition of a pipe operation.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};

use crate::errors::PipeError;

/// Program, arguments, and environment overrides for the external process.
///
/// Environment entries are merged into the ambient environment of the
/// host process, never replacing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeCommand {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

impl PipeCommand {
    /// Command running `program` with no arguments and no overrides.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            env: BTreeMap::new(),
        }
    }

    /// Build from a full argv whose first element is the program.
    ///
    /// # Errors
    ///
    /// Returns `PipeError::InvalidState` if `argv` is empty or the program is blank.
    pub fn from_argv(argv: Vec<String>) -> Result<Self, PipeError> {
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self {
                argv,
                env: BTreeMap::new(),
            }),
            _ => Err(PipeError::InvalidState(
                "command must name a program".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add or replace one environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// `std::process::Command` with all three standard streams piped.
    pub(crate) fn to_process_command(&self) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl std::fmt::Display for PipeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}
