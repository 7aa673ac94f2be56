//! Pipe YAML configuration model.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::command::PipeCommand;
use crate::errors::PipeError;
use crate::execution::{auto_parallelism, PartitionFailurePolicy, PipeOptions};

/// Default on-disk location of the quarantine database.
pub const DEFAULT_QUARANTINE_PATH: &str = "rapidpipe_quarantine.db";

/// Top-level pipe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipeConfig {
    pub version: String,
    pub pipe: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub format: RecordFormat,
    #[serde(default)]
    pub quarantine: Option<QuarantineConfig>,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub on_partition_failure: PartitionFailurePolicy,
}

impl PipeConfig {
    /// # Errors
    ///
    /// `InvalidState` if `command` names no program.
    pub fn pipe_command(&self) -> Result<PipeCommand, PipeError> {
        Ok(PipeCommand::from_argv(self.command.clone())?.envs(self.env.clone()))
    }

    pub fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            parallelism: self.resources.parallelism.resolve(),
            on_partition_failure: self.on_partition_failure,
        }
    }
}

/// Record encoding exchanged with the external process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    #[default]
    JsonLines,
    ArrowIpc,
}

impl std::fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JsonLines => f.write_str("json_lines"),
            Self::ArrowIpc => f.write_str("arrow_ipc"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuarantineConfig {
    /// Destination table name.
    pub location: String,
    #[serde(default = "default_quarantine_path")]
    pub path: PathBuf,
}

fn default_quarantine_path() -> PathBuf {
    PathBuf::from(DEFAULT_QUARANTINE_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    #[serde(default)]
    pub parallelism: PipeParallelism,
}

/// `parallelism: auto` or a fixed partition concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "ParallelismValue")]
pub enum PipeParallelism {
    #[default]
    Auto,
    Manual(u32),
}

impl PipeParallelism {
    /// Concrete concurrency: available cores (capped) for `auto`.
    pub fn resolve(self) -> usize {
        match self {
            Self::Auto => auto_parallelism(),
            Self::Manual(n) => n as usize,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParallelismValue {
    Count(u32),
    Keyword(String),
}

impl TryFrom<ParallelismValue> for PipeParallelism {
    type Error = String;

    fn try_from(value: ParallelismValue) -> Result<Self, Self::Error> {
        match value {
            ParallelismValue::Count(n) => Ok(Self::Manual(n)),
            ParallelismValue::Keyword(k) if k == "auto" => Ok(Self::Auto),
            ParallelismValue::Keyword(k) => Err(format!(
                "invalid parallelism '{k}', expected 'auto' or a positive integer"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_accepts_auto_and_counts() {
        let auto: PipeParallelism = serde_yaml::from_str("auto").unwrap();
        assert_eq!(auto, PipeParallelism::Auto);
        let four: PipeParallelism = serde_yaml::from_str("4").unwrap();
        assert_eq!(four, PipeParallelism::Manual(4));
        assert_eq!(four.resolve(), 4);
        assert!(serde_yaml::from_str::<PipeParallelism>("fast").is_err());
    }

    #[test]
    fn auto_resolves_within_cap() {
        let n = PipeParallelism::Auto.resolve();
        assert!((1..=crate::execution::MAX_AUTO_PARALLELISM).contains(&n));
    }

    #[test]
    fn record_format_names() {
        let f: RecordFormat = serde_yaml::from_str("arrow_ipc").unwrap();
        assert_eq!(f, RecordFormat::ArrowIpc);
        assert_eq!(RecordFormat::JsonLines.to_string(), "json_lines");
    }
}
