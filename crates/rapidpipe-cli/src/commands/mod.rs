pub mod check;
pub mod quarantine;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rapidpipe_engine::config::{parser, validator, PipeConfig, QuarantineConfig};
use rapidpipe_state::SqliteQuarantineStore;

/// Parse and validate a pipe YAML file.
pub(crate) fn load_config(pipe_path: &Path) -> Result<PipeConfig> {
    let config = parser::parse_pipe(pipe_path)
        .with_context(|| format!("Failed to parse pipe: {}", pipe_path.display()))?;
    validator::validate_pipe(&config)?;
    Ok(config)
}

/// Open the quarantine database, creating its parent directory if needed.
pub(crate) fn open_quarantine_store(
    quarantine: &QuarantineConfig,
) -> Result<Arc<SqliteQuarantineStore>> {
    if let Some(parent) = quarantine.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create quarantine directory: {}", parent.display())
        })?;
    }
    let store = SqliteQuarantineStore::open(&quarantine.path).with_context(|| {
        format!(
            "Failed to open quarantine store: {}",
            quarantine.path.display()
        )
    })?;
    Ok(Arc::new(store))
}
