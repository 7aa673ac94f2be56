//! Semantic validation for parsed pipe configuration values.

use anyhow::{bail, Result};

use crate::config::types::{PipeConfig, PipeParallelism};
use crate::execution::PartitionFailurePolicy;

fn validate_env_keys(config: &PipeConfig, errors: &mut Vec<String>) {
    for key in config.env.keys() {
        if key.is_empty() {
            errors.push("env: empty variable name".to_string());
        } else if key.contains('=') || key.contains('\0') {
            errors.push(format!("env: invalid variable name '{key}'"));
        }
    }
}

/// Validate a parsed pipe configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipe config.
pub fn validate_pipe(config: &PipeConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipe version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipe.trim().is_empty() {
        errors.push("Pipe name must not be empty".to_string());
    }

    match config.command.first() {
        None => errors.push("command must name a program".to_string()),
        Some(program) if program.trim().is_empty() => {
            errors.push("command program must not be blank".to_string());
        }
        Some(_) => {}
    }

    validate_env_keys(config, &mut errors);

    if let Some(quarantine) = &config.quarantine {
        if quarantine.location.trim().is_empty() {
            errors.push("quarantine location must not be empty".to_string());
        }
    }

    if matches!(config.resources.parallelism, PipeParallelism::Manual(0)) {
        errors.push("parallelism must be at least 1".to_string());
    }

    if config.on_partition_failure == PartitionFailurePolicy::SkipQuarantined
        && config.quarantine.is_none()
    {
        errors.push(
            "on_partition_failure 'skip_quarantined' requires a quarantine section".to_string(),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipe validation failed:\n  - {}", errors.join("\n  - "));
    }
}
