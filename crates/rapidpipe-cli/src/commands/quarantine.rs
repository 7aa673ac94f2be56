use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use rapidpipe_state::QuarantineStore;
use rapidpipe_types::ids::QuarantineLocation;

use super::{load_config, open_quarantine_store};

/// Execute the `quarantine` command: print every quarantined record of the
/// pipe's location as one JSON object per line.
pub fn execute(pipe_path: &Path) -> Result<()> {
    let config = load_config(pipe_path)?;
    let Some(quarantine) = &config.quarantine else {
        anyhow::bail!("Pipe '{}' has no quarantine section", config.pipe);
    };

    let store = open_quarantine_store(quarantine)?;
    let location = QuarantineLocation::new(quarantine.location.clone());
    let records = store
        .load(&location)
        .with_context(|| format!("Failed to load quarantine records from `{location}`"))?;

    let mut out = std::io::stdout().lock();
    for record in &records {
        serde_json::to_writer(&mut out, record).context("Failed to encode quarantine record")?;
        out.write_all(b"\n").context("Failed to write output")?;
    }
    out.flush().context("Failed to flush output")?;

    tracing::info!(
        pipe = config.pipe,
        location = %location,
        records = records.len(),
        "Listed quarantined records"
    );
    Ok(())
}
