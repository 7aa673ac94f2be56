//! Pipe orchestrator: pipes every partition in parallel, materializes the
//! per-partition results, reconciles schemas, and builds the output table.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::{CacheRegistry, ExecutionContext};
use crate::errors::PipeError;
use crate::execution::{CancelFlag, PartitionFailurePolicy, PartitionedInput, PipeOptions};
use crate::formatter::{InputFormatter, OutputFormatter};
use crate::piper::{collect_partition, PartitionPiper, PartitionResult};
use crate::quarantine::QuarantineOutcome;
use crate::result::{PipeOutcome, PipeReport, PipedTable, QuarantinedPartition};

type PartitionTaskResult<O> = (
    usize,
    Result<PartitionResult<<O as OutputFormatter>::Schema, <O as OutputFormatter>::Record>, PipeError>,
);

pub struct PipeOrchestrator<I: InputFormatter, O: OutputFormatter> {
    name: String,
    piper: PartitionPiper<I, O>,
    options: PipeOptions,
    fallback_schema: Option<O::Schema>,
    registry: Arc<CacheRegistry>,
    context: ExecutionContext,
}

impl<I: InputFormatter, O: OutputFormatter> PipeOrchestrator<I, O> {
    /// Orchestrator registering results in the shared registry under a
    /// fresh execution context.
    pub fn new(name: impl Into<String>, piper: PartitionPiper<I, O>, options: PipeOptions) -> Self {
        Self {
            name: name.into(),
            piper,
            options,
            fallback_schema: None,
            registry: CacheRegistry::shared(),
            context: ExecutionContext::new(),
        }
    }

    /// Schema reported when no partition produced any output.
    #[must_use]
    pub fn with_fallback_schema(mut self, schema: O::Schema) -> Self {
        self.fallback_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, registry: Arc<CacheRegistry>, context: ExecutionContext) -> Self {
        self.registry = registry;
        self.context = context;
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn options(&self) -> &PipeOptions {
        &self.options
    }

    /// Pipe every partition of `input` through the external command.
    ///
    /// # Errors
    ///
    /// The first fatal partition failure (siblings are cancelled), or
    /// `SchemaMismatch` if partitions disagree on the output schema.
    pub async fn run(
        &self,
        input: PartitionedInput<I::Record>,
    ) -> Result<PipeOutcome<O::Schema, O::Record>, PipeError> {
        let start = Instant::now();
        let partitions = input.len();
        let parallelism = self.options.parallelism.clamp(1, partitions.max(1));

        if partitions == 0 {
            tracing::info!(pipe = %self.name, "No partitions to pipe");
            return Ok(PipeOutcome {
                table: PipedTable::new(self.fallback_schema.clone(), Arc::new(Vec::new())),
                report: PipeReport {
                    parallelism,
                    duration_secs: start.elapsed().as_secs_f64(),
                    ..PipeReport::default()
                },
            });
        }

        let empty_partitions = input.iter().filter(|p| p.is_empty()).count();
        let records_in: u64 = input.iter().map(|p| p.len() as u64).sum();
        tracing::info!(
            pipe = %self.name,
            command = %self.piper.command(),
            partitions,
            records_in,
            parallelism,
            "Starting pipe"
        );

        let cancel = CancelFlag::new();
        let join_set = self.spawn_partitions(input, parallelism, &cancel);
        let (results, quarantined) = self.collect_partition_results(join_set, partitions, &cancel).await?;

        let materialized = Arc::new(results);
        self.registry
            .register(&self.context, &self.name, partitions, Arc::clone(&materialized));

        let schema = self.reconcile_schemas(&materialized)?;
        let table = PipedTable::new(schema, materialized);

        let report = PipeReport {
            partitions,
            empty_partitions,
            records_in,
            records_out: table.num_records() as u64,
            quarantined,
            duration_secs: start.elapsed().as_secs_f64(),
            parallelism,
        };
        tracing::info!(
            pipe = %self.name,
            records_out = report.records_out,
            quarantined_partitions = report.quarantined.len(),
            duration_secs = report.duration_secs,
            "Pipe completed"
        );
        Ok(PipeOutcome { table, report })
    }

    fn spawn_partitions(
        &self,
        input: PartitionedInput<I::Record>,
        parallelism: usize,
        cancel: &CancelFlag,
    ) -> JoinSet<PartitionTaskResult<O>> {
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut join_set = JoinSet::new();

        for (index, records) in input.into_iter().enumerate() {
            let piper = self.piper.clone();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let result = async {
                    let permit = semaphore.acquire_owned().await.map_err(|e| {
                        PipeError::from(anyhow::anyhow!("Semaphore closed: {e}"))
                    })?;
                    if cancel.is_cancelled() {
                        return Err(PipeError::Cancelled { partition: index });
                    }
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        let output = piper.pipe(index, records, Some(cancel))?;
                        collect_partition(index, output)
                    })
                    .await
                    .map_err(|e| {
                        PipeError::from(anyhow::anyhow!("Partition {index} task panicked: {e}"))
                    })?
                }
                .await;
                (index, result)
            });
        }
        join_set
    }

    async fn collect_partition_results(
        &self,
        mut join_set: JoinSet<PartitionTaskResult<O>>,
        partitions: usize,
        cancel: &CancelFlag,
    ) -> Result<(Vec<PartitionResult<O::Schema, O::Record>>, Vec<QuarantinedPartition>), PipeError> {
        let mut slots: Vec<Option<PartitionResult<O::Schema, O::Record>>> =
            (0..partitions).map(|_| None).collect();
        let mut quarantined = Vec::new();
        let mut first_error: Option<PipeError> = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(result))) => slots[index] = Some(result),
                Ok((index, Err(error))) if first_error.is_none() => {
                    if let Some(skipped) = self.skippable(index, &error) {
                        tracing::warn!(
                            pipe = %self.name,
                            partition = index,
                            error = %error,
                            "Skipping quarantined partition"
                        );
                        quarantined.push(skipped);
                        slots[index] = Some(PartitionResult::empty());
                        continue;
                    }
                    tracing::error!(pipe = %self.name, partition = index, error = %error, "Partition failed");
                    cancel.cancel();
                    join_set.abort_all();
                    first_error = Some(error);
                }
                Ok((index, Err(error))) => {
                    tracing::debug!(partition = index, error = %error, "Secondary partition failure");
                }
                Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {
                    // Expected: sibling tasks cancelled after first partition failure.
                }
                Err(join_err) => {
                    cancel.cancel();
                    join_set.abort_all();
                    if first_error.is_none() {
                        first_error = Some(PipeError::from(anyhow::anyhow!(
                            "Partition task panicked: {join_err}"
                        )));
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        let results = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    PipeError::InvalidState(format!("partition {index} produced no result"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        quarantined.sort_by_key(|q| q.partition);
        Ok((results, quarantined))
    }

    /// A partition failure absorbed by `skip_quarantined`, if any.
    fn skippable(&self, partition: usize, error: &PipeError) -> Option<QuarantinedPartition> {
        if self.options.on_partition_failure != PartitionFailurePolicy::SkipQuarantined {
            return None;
        }
        match error {
            PipeError::SubprocessFailed {
                exit_code,
                quarantine: QuarantineOutcome::Quarantined { location, records },
                ..
            } => Some(QuarantinedPartition {
                partition,
                exit_code: *exit_code,
                location: location.clone(),
                records: *records,
            }),
            _ => None,
        }
    }

    /// Exactly one distinct schema across non-empty partitions.
    fn reconcile_schemas(
        &self,
        results: &[PartitionResult<O::Schema, O::Record>],
    ) -> Result<Option<O::Schema>, PipeError> {
        let mut distinct: Vec<&O::Schema> = Vec::new();
        for schema in results.iter().filter_map(|p| p.schema.as_ref()) {
            if !distinct.contains(&schema) {
                distinct.push(schema);
            }
        }
        match distinct.as_slice() {
            [] => {
                tracing::debug!(pipe = %self.name, "No partition produced output");
                Ok(self.fallback_schema.clone())
            }
            [schema] => Ok(Some((*schema).clone())),
            many => {
                let formatter = self.piper.output_formatter();
                Err(PipeError::SchemaMismatch {
                    schemas: many.iter().map(|s| formatter.describe_schema(s)).collect(),
                })
            }
        }
    }

    /// Unpersist every cached result of this orchestrator's context.
    /// Returns the number of entries removed.
    pub fn clear_cache(&self) -> usize {
        self.registry.invalidate(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PipeCommand;
    use crate::formats::{JsonLinesInput, JsonLinesOutput};
    use serde_json::{json, Value};

    fn orchestrator(command: PipeCommand) -> (PipeOrchestrator<JsonLinesInput, JsonLinesOutput>, Arc<CacheRegistry>) {
        let registry = Arc::new(CacheRegistry::default());
        let piper = PartitionPiper::new(command, JsonLinesInput::default(), JsonLinesOutput);
        let options = PipeOptions {
            parallelism: 2,
            on_partition_failure: PartitionFailurePolicy::Abort,
        };
        let orch = PipeOrchestrator::new("test", piper, options)
            .with_cache(Arc::clone(&registry), ExecutionContext::new());
        (orch, registry)
    }

    #[tokio::test]
    async fn zero_partitions_short_circuit() {
        let (orch, registry) = orchestrator(PipeCommand::new("/nonexistent/rapidpipe-test-binary"));
        let outcome = orch.run(Vec::<Vec<Value>>::new()).await.unwrap();
        assert!(outcome.table.schema().is_none());
        assert_eq!(outcome.table.num_partitions(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn all_empty_partitions_use_fallback_schema() {
        let (orch, _registry) = orchestrator(PipeCommand::new("/nonexistent/rapidpipe-test-binary"));
        let fallback = crate::formats::json_lines::infer_schema(&json!({"id": 1}));
        let orch = orch.with_fallback_schema(fallback.clone());
        let outcome = orch.run(vec![vec![], vec![]]).await.unwrap();
        assert_eq!(outcome.table.schema(), Some(&fallback));
        assert_eq!(outcome.report.empty_partitions, 2);
        assert_eq!(outcome.table.num_records(), 0);
    }

    #[tokio::test]
    async fn all_empty_partitions_without_fallback_are_indeterminate() {
        let (orch, _registry) = orchestrator(PipeCommand::new("cat"));
        let outcome = orch.run(vec![vec![]]).await.unwrap();
        assert!(outcome.table.schema().is_none());
    }

    #[tokio::test]
    async fn first_failure_aborts_operation() {
        let (orch, _registry) =
            orchestrator(PipeCommand::new("sh").arg("-c").arg("cat >/dev/null; exit 4"));
        let err = orch.run(vec![vec![json!(1)], vec![json!(2)]]).await.unwrap_err();
        assert!(matches!(err, PipeError::SubprocessFailed { exit_code: 4, .. }), "got {err}");
    }

    #[test]
    fn first_failure_kills_running_siblings() {
        // Partition 0 fails shortly after start; partition 1 would sleep for 30s.
        let script = r#"read x; if [ "$x" = 1 ]; then sleep 0.2; exit 4; fi; exec sleep 30"#;
        let (orch, _registry) = orchestrator(PipeCommand::new("sh").arg("-c").arg(script));

        let started = std::time::Instant::now();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(orch.run(vec![vec![json!(1)], vec![json!(2)]]));
        // Dropping the runtime waits for the blocking partition tasks.
        drop(runtime);

        let err = result.unwrap_err();
        assert!(matches!(err, PipeError::SubprocessFailed { exit_code: 4, .. }), "got {err}");
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "sibling partition outlived cancellation: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() {
        let (orch, registry) = orchestrator(PipeCommand::new("/nonexistent/rapidpipe-test-binary"));
        let err = orch.run(vec![vec![json!(1)]]).await.unwrap_err();
        assert!(matches!(err, PipeError::ProcessSpawnFailed { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn results_are_registered_until_cleared() {
        let (orch, registry) = orchestrator(PipeCommand::new("cat"));
        orch.run(vec![vec![json!(1)], vec![json!(2)]]).await.unwrap();
        orch.run(vec![vec![json!(3)]]).await.unwrap();
        assert_eq!(registry.entries(orch.context()).len(), 2);
        assert_eq!(orch.clear_cache(), 2);
        assert_eq!(orch.clear_cache(), 0);
        assert!(registry.is_empty());
    }
}
