//! Pipe YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipeConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == &caps[1]) {
                missing.push(caps[1].to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(substituted.into_owned())
}

/// Parse a pipe YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_pipe_str(yaml_str: &str) -> Result<PipeConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    serde_yaml::from_str(&substituted).context("Failed to parse pipe YAML")
}

/// Parse a pipe YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_pipe(path: &Path) -> Result<PipeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipe file: {}", path.display()))?;
    parse_pipe_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{PipeParallelism, RecordFormat};
    use crate::execution::PartitionFailurePolicy;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("RP_TEST_MODE", "fast");
        let result = substitute_env_vars("mode: ${RP_TEST_MODE}\n").unwrap();
        assert_eq!(result, "mode: fast\n");
        std::env::remove_var("RP_TEST_MODE");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "pipe: x\ncommand: [cat]";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let err = substitute_env_vars("${RP_MISSING_X} ${RP_MISSING_Y} ${RP_MISSING_X}")
            .unwrap_err()
            .to_string();
        assert_eq!(err, "Missing environment variable(s): RP_MISSING_X, RP_MISSING_Y");
    }

    #[test]
    fn test_parse_full_pipe() {
        std::env::set_var("RP_TEST_LOCATION", "quarantine.enrich");
        let yaml = r#"
version: "1.0"
pipe: enrich_events
command: ["python3", "enrich.py", "--fast"]
env:
  MODE: fast
format: arrow_ipc
quarantine:
  location: ${RP_TEST_LOCATION}
  path: ./state/q.db
resources:
  parallelism: 3
on_partition_failure: skip_quarantined
"#;
        let config = parse_pipe_str(yaml).unwrap();
        assert_eq!(config.pipe, "enrich_events");
        assert_eq!(config.command, ["python3", "enrich.py", "--fast"]);
        assert_eq!(config.env["MODE"], "fast");
        assert_eq!(config.format, RecordFormat::ArrowIpc);
        let quarantine = config.quarantine.as_ref().unwrap();
        assert_eq!(quarantine.location, "quarantine.enrich");
        assert_eq!(quarantine.path, Path::new("./state/q.db"));
        assert_eq!(config.resources.parallelism, PipeParallelism::Manual(3));
        assert_eq!(config.on_partition_failure, PartitionFailurePolicy::SkipQuarantined);

        let command = config.pipe_command().unwrap();
        assert_eq!(command.program(), "python3");
        assert_eq!(command.env_overrides()["MODE"], "fast");
        assert_eq!(config.pipe_options().parallelism, 3);
        std::env::remove_var("RP_TEST_LOCATION");
    }

    #[test]
    fn test_minimal_pipe_uses_defaults() {
        let config = parse_pipe_str("version: \"1.0\"\npipe: p\ncommand: [cat]\n").unwrap();
        assert_eq!(config.format, RecordFormat::JsonLines);
        assert!(config.quarantine.is_none());
        assert_eq!(config.resources.parallelism, PipeParallelism::Auto);
        assert_eq!(config.on_partition_failure, PartitionFailurePolicy::Abort);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = "version: \"1.0\"\npipe: p\ncommand: [cat]\nretries: 3\n";
        assert!(parse_pipe_str(yaml).is_err());
    }

    #[test]
    fn test_parse_pipe_file_not_found() {
        let err = parse_pipe(Path::new("/nonexistent/pipe.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read pipe file"));
    }
}
