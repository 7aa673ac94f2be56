use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use rapidpipe_engine::config::{PipeConfig, RecordFormat};
use rapidpipe_engine::execution::partition_evenly;
use rapidpipe_engine::formats::arrow_ipc::{read_ipc_batches, write_ipc_batches};
use rapidpipe_engine::formats::{ArrowIpcInput, ArrowIpcOutput, JsonLinesInput, JsonLinesOutput};
use rapidpipe_engine::{
    InputFormatter, OutputFormatter, PartitionPiper, PipeOrchestrator, PipeReport,
    QuarantineHandler, QuarantinePayload, QuarantineTarget, StoreQuarantine,
};
use rapidpipe_state::{QuarantineStore, SqliteQuarantineStore};
use rapidpipe_types::ids::{PipeId, QuarantineLocation};

use super::{load_config, open_quarantine_store};

/// Execute the `run` command: parse, validate, and pipe the input file.
pub async fn execute(
    pipe_path: &Path,
    input_path: &Path,
    partitions: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    let config = load_config(pipe_path)?;
    let command = config.pipe_command()?;
    let options = config.pipe_options();
    let partitions = partitions.unwrap_or(options.parallelism).max(1);

    tracing::info!(
        pipe = config.pipe,
        command = %command,
        format = %config.format,
        partitions,
        "Pipe validated"
    );

    let store = config
        .quarantine
        .as_ref()
        .map(open_quarantine_store)
        .transpose()?;

    let report = match config.format {
        RecordFormat::JsonLines => {
            let records = read_json_lines(input_path)?;
            let piper = PartitionPiper::new(command, JsonLinesInput::default(), JsonLinesOutput);
            let orchestrator = PipeOrchestrator::new(
                config.pipe.clone(),
                attach_quarantine(piper, &config, store.as_ref()),
                options,
            );
            let outcome = orchestrator
                .run(partition_evenly(records, partitions))
                .await?;
            write_json_lines(output, outcome.table.records())?;
            orchestrator.clear_cache();
            outcome.report
        }
        RecordFormat::ArrowIpc => {
            let file = File::open(input_path)
                .with_context(|| format!("Failed to open input: {}", input_path.display()))?;
            let (_, batches) = read_ipc_batches(BufReader::new(file))?;
            let piper = PartitionPiper::new(command, ArrowIpcInput::default(), ArrowIpcOutput);
            let orchestrator = PipeOrchestrator::new(
                config.pipe.clone(),
                attach_quarantine(piper, &config, store.as_ref()),
                options,
            );
            let outcome = orchestrator
                .run(partition_evenly(batches, partitions))
                .await?;
            if let Some(schema) = outcome.table.schema() {
                let batches: Vec<_> = outcome.table.records().cloned().collect();
                write_ipc_batches(open_output(output)?, schema, &batches)?;
            }
            orchestrator.clear_cache();
            outcome.report
        }
    };

    print_summary(&config.pipe, &report);
    Ok(())
}

fn attach_quarantine<I, O>(
    piper: PartitionPiper<I, O>,
    config: &PipeConfig,
    store: Option<&Arc<SqliteQuarantineStore>>,
) -> PartitionPiper<I, O>
where
    I: InputFormatter,
    I::Record: QuarantinePayload,
    O: OutputFormatter,
{
    let (Some(quarantine), Some(store)) = (config.quarantine.as_ref(), store) else {
        return piper;
    };
    let store: Arc<dyn QuarantineStore> = Arc::clone(store) as Arc<dyn QuarantineStore>;
    let handler: Arc<dyn QuarantineHandler<I::Record>> =
        Arc::new(StoreQuarantine::new(store, PipeId::new(config.pipe.clone())));
    piper.with_quarantine(QuarantineTarget::new(
        handler,
        QuarantineLocation::new(quarantine.location.clone()),
    ))
}

/// Read one JSON document per non-blank line.
fn read_json_lines(path: &Path) -> Result<Vec<Value>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open input: {}", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read input: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), i + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn open_output(output: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to create output: {}", path.display())
        })?)),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    })
}

fn write_json_lines<'a>(
    output: Option<&Path>,
    records: impl Iterator<Item = &'a Value>,
) -> Result<()> {
    let mut out = open_output(output)?;
    for record in records {
        serde_json::to_writer(&mut out, record).context("Failed to encode output record")?;
        out.write_all(b"\n").context("Failed to write output")?;
    }
    out.flush().context("Failed to flush output")
}

fn print_summary(pipe: &str, report: &PipeReport) {
    eprintln!("Pipe '{pipe}' completed successfully.");
    eprintln!(
        "  Partitions:      {} ({} empty)",
        report.partitions, report.empty_partitions
    );
    eprintln!("  Records in:      {}", report.records_in);
    eprintln!("  Records out:     {}", report.records_out);
    if !report.quarantined.is_empty() {
        eprintln!("  Quarantined:     {} partition(s)", report.quarantined.len());
        for q in &report.quarantined {
            eprintln!(
                "    Partition[{}]: {} record(s) to {} (exit code {})",
                q.partition, q.records, q.location, q.exit_code
            );
        }
    }
    eprintln!("  Parallelism:     {}", report.parallelism);
    eprintln!("  Duration:        {:.2}s", report.duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_lines_input_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\n  \n2\n").unwrap();
        assert_eq!(read_json_lines(&path).unwrap(), vec![json!({"a": 1}), json!(2)]);
    }

    #[test]
    fn json_lines_input_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "1\n{oops\n").unwrap();
        let err = format!("{:#}", read_json_lines(&path).unwrap_err());
        assert!(err.contains("in.jsonl:2: invalid JSON"), "got: {err}");
    }

    #[test]
    fn json_lines_output_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let records = [json!({"a": 1}), json!("x")];
        write_json_lines(Some(&path), records.iter()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}\n\"x\"\n");
        assert_eq!(read_json_lines(&path).unwrap(), records);
    }
}
