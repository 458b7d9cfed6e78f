//! Harness driver: runs a pipeline to completion and collects its outcome.

use crate::error::HarnessError;
use crate::pipeline::{
    Batch, Pipeline, Record, StageError, StageFailure, StageNode, ERROR_STAGE_ATTRIBUTE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default bound on a single run.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The source finished and every batch reached the sinks
    Finished,
    /// A stage failed terminally
    RunError,
}

/// Everything observed during a finished run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub title: String,
    pub status: RunStatus,
    /// Records that reached any sink, in arrival order
    pub output_records: Vec<Record>,
    /// Records per sink instance id
    pub outputs_by_sink: BTreeMap<String, Vec<Record>>,
    pub error_records: Vec<Record>,
    pub stage_errors: Vec<StageError>,
    pub metrics: BTreeMap<String, u64>,
    pub duration: Duration,
}

impl RunResult {
    fn new(title: String) -> Self {
        Self {
            title,
            status: RunStatus::Finished,
            output_records: Vec::new(),
            outputs_by_sink: BTreeMap::new(),
            error_records: Vec::new(),
            stage_errors: Vec::new(),
            metrics: BTreeMap::new(),
            duration: Duration::ZERO,
        }
    }

    fn count(&mut self, key: impl Into<String>, n: usize) {
        *self.metrics.entry(key.into()).or_default() += n as u64;
    }

    pub fn output_count(&self) -> usize {
        self.output_records.len()
    }

    pub fn error_count(&self) -> usize {
        self.error_records.len()
    }

    /// Counter value, 0 when never incremented.
    pub fn metric(&self, name: &str) -> u64 {
        self.metrics.get(name).copied().unwrap_or(0)
    }

    /// Records captured by one sink.
    pub fn output_for(&self, sink_id: &str) -> &[Record] {
        self.outputs_by_sink
            .get(sink_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn expect_output_count(&self, expected: usize) -> Result<(), HarnessError> {
        check("output records", expected, self.output_count())
    }

    pub fn expect_error_count(&self, expected: usize) -> Result<(), HarnessError> {
        check("error records", expected, self.error_count())
    }

    pub fn expect_stage_error_count(&self, expected: usize) -> Result<(), HarnessError> {
        check("stage errors", expected, self.stage_errors.len())
    }

    /// At least one error record or stage error carries `code`.
    pub fn expect_error_code(&self, code: &str) -> Result<(), HarnessError> {
        let mut observed: Vec<&str> = self
            .error_records
            .iter()
            .filter_map(Record::error_code)
            .chain(self.stage_errors.iter().map(|e| e.error_code.as_str()))
            .collect();
        if observed.contains(&code) {
            return Ok(());
        }
        observed.dedup();
        Err(HarnessError::assertion(
            "error code",
            code,
            format!("{:?}", observed),
        ))
    }

    /// Output record `index` has `expected` at `pointer`.
    pub fn expect_field(
        &self,
        index: usize,
        pointer: &str,
        expected: &serde_json::Value,
    ) -> Result<(), HarnessError> {
        let observed = self
            .output_records
            .get(index)
            .and_then(|record| record.field(pointer));
        match observed {
            Some(value) if value == expected => Ok(()),
            Some(value) => Err(HarnessError::assertion(
                format!("output record {} field {}", index, pointer),
                expected,
                value,
            )),
            None => Err(HarnessError::assertion(
                format!("output record {} field {}", index, pointer),
                expected,
                "<missing>",
            )),
        }
    }
}

fn check(what: &str, expected: usize, observed: usize) -> Result<(), HarnessError> {
    if expected == observed {
        Ok(())
    } else {
        Err(HarnessError::assertion(what, expected, observed))
    }
}

/// Runs pipelines with a bounded wait.
#[derive(Debug, Clone)]
pub struct Harness {
    max_wait: Duration,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Run until the source is finished, a stage fails, or `max_wait` elapses.
    pub async fn run(&self, pipeline: Pipeline) -> Result<RunResult, HarnessError> {
        let title = pipeline.title.clone();
        info!(pipeline = %title, stages = ?pipeline.stage_ids(), "Starting run");

        match tokio::time::timeout(self.max_wait, execute(pipeline)).await {
            Ok(Ok(result)) => {
                info!(
                    pipeline = %title,
                    output_records = result.output_count(),
                    error_records = result.error_count(),
                    stage_errors = result.stage_errors.len(),
                    duration_ms = result.duration.as_millis() as u64,
                    "Run finished"
                );
                Ok(result)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(pipeline = %title, max_wait = ?self.max_wait, "Run did not finish in time");
                Err(HarnessError::Timeout(self.max_wait))
            }
        }
    }
}

fn run_failed(stage: &str, failure: StageFailure) -> HarnessError {
    error!(
        stage = %stage,
        error_code = %failure.error_code,
        message = %failure.message,
        "Stage failed, stopping run"
    );
    HarnessError::RunFailed {
        stage: stage.to_string(),
        error_code: failure.error_code,
        message: failure.message,
    }
}

async fn execute(pipeline: Pipeline) -> Result<RunResult, HarnessError> {
    let started = Instant::now();
    let Pipeline {
        title,
        mut nodes,
        downstream,
        order,
        source,
    } = pipeline;
    let mut result = RunResult::new(title);
    let mut batches = 0usize;

    loop {
        let next = match &mut nodes[source].stage {
            StageNode::Source(stage) => stage.next_batch().await,
            _ => Ok(None),
        };
        let Some(batch) = next.map_err(|f| run_failed(&nodes[source].id, f))? else {
            break;
        };
        batches += 1;
        debug!(batch = batches, records = batch.len(), "Source produced batch");
        result.count("pipeline.input_records", batch.len());

        let mut inbox: Vec<Batch> = vec![Vec::new(); nodes.len()];
        let mut errors: Batch = Vec::new();
        inbox[source] = batch;

        for &index in &order {
            let records = std::mem::take(&mut inbox[index]);
            let node = &nodes[index];
            let forwarded = match &node.stage {
                StageNode::Source(_) => records,
                StageNode::Processor(stage) => {
                    result.count(format!("stage.{}.input_records", node.id), records.len());
                    let output = stage
                        .process(records)
                        .await
                        .map_err(|f| run_failed(&node.id, f))?;

                    result.count(format!("stage.{}.output_records", node.id), output.records.len());
                    result.count(
                        format!("stage.{}.error_records", node.id),
                        output.error_records.len(),
                    );
                    result.count(format!("stage.{}.errors", node.id), output.stage_errors.len());

                    for mut record in output.error_records {
                        record.set_attribute(ERROR_STAGE_ATTRIBUTE, node.id.as_str());
                        errors.push(record);
                    }
                    for failure in output.stage_errors {
                        warn!(
                            stage = %node.id,
                            error_code = %failure.error_code,
                            message = %failure.message,
                            "Stage error"
                        );
                        result.stage_errors.push(StageError {
                            stage: node.id.clone(),
                            error_code: failure.error_code,
                            message: failure.message,
                        });
                    }
                    output.records
                }
                StageNode::Sink(stage) => {
                    stage.write(&records);
                    result.count("pipeline.output_records", records.len());
                    result
                        .outputs_by_sink
                        .entry(node.id.clone())
                        .or_default()
                        .extend(records.iter().cloned());
                    result.output_records.extend(records);
                    continue;
                }
            };

            for &target in &downstream[index] {
                inbox[target].extend(forwarded.iter().cloned());
            }
        }

        if !errors.is_empty() {
            for node in &nodes {
                if let StageNode::Sink(stage) = &node.stage {
                    stage.write_errors(&errors);
                }
            }
            result.count("pipeline.error_records", errors.len());
            result.error_records.extend(errors);
        }
    }

    let stage_errors = result.stage_errors.len();
    result.count("pipeline.stage_errors", stage_errors);
    result.count("pipeline.batches", batches);
    result.duration = started.elapsed();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineBuilder, Processor, Source, StageOutput};
    use crate::stages::{RawDataSource, Wiretap};
    use async_trait::async_trait;
    use serde_json::json;

    /// Sends every other record to error handling.
    struct Alternate;

    #[async_trait]
    impl Processor for Alternate {
        fn name(&self) -> &str {
            "Alternate"
        }

        async fn process(&self, batch: Batch) -> Result<StageOutput, StageFailure> {
            let mut out = StageOutput::default();
            for (i, record) in batch.into_iter().enumerate() {
                if i % 2 == 0 {
                    out.records.push(record);
                } else {
                    out.error_records.push(record.into_error("ALT_01", "odd record"));
                }
            }
            out.stage_errors.push(StageFailure::new("ALT_02", "noted"));
            Ok(out)
        }
    }

    struct Explode;

    #[async_trait]
    impl Processor for Explode {
        fn name(&self) -> &str {
            "Explode"
        }

        async fn process(&self, _batch: Batch) -> Result<StageOutput, StageFailure> {
            Err(StageFailure::new("BOOM_01", "exploded"))
        }
    }

    /// Never finishes.
    struct Endless;

    #[async_trait]
    impl Source for Endless {
        fn name(&self) -> &str {
            "Endless"
        }

        async fn next_batch(&mut self) -> Result<Option<Batch>, StageFailure> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Some(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_passthrough_run() {
        let wiretap = Wiretap::new();
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(RawDataSource::text("a\nb\nc").with_batches(2));
        let sink = builder.add_sink(wiretap.clone());
        builder.connect(source, sink);

        let result = Harness::new()
            .run(builder.build("passthrough").unwrap())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Finished);
        result.expect_output_count(6).unwrap();
        result.expect_error_count(0).unwrap();
        assert_eq!(result.metric("pipeline.input_records"), 6);
        assert_eq!(result.metric("pipeline.batches"), 2);
        assert_eq!(wiretap.output_records().len(), 6);
        result.expect_field(0, "/text", &json!("a")).unwrap();
    }

    #[tokio::test]
    async fn test_error_records_and_stage_errors() {
        let wiretap = Wiretap::new();
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(RawDataSource::text("a\nb\nc"));
        let alternate = builder.add_processor(Alternate);
        let sink = builder.add_sink(wiretap.clone());
        builder.connect(source, alternate).connect(alternate, sink);

        let result = Harness::new().run(builder.build("alt").unwrap()).await.unwrap();

        result.expect_output_count(2).unwrap();
        result.expect_error_count(1).unwrap();
        result.expect_stage_error_count(1).unwrap();
        result.expect_error_code("ALT_01").unwrap();
        result.expect_error_code("ALT_02").unwrap();
        assert!(result.expect_error_code("HTTP_01").is_err());

        assert_eq!(
            result.error_records[0].attribute(ERROR_STAGE_ATTRIBUTE),
            Some("Alternate_02")
        );
        assert_eq!(result.stage_errors[0].stage, "Alternate_02");
        assert_eq!(result.metric("stage.Alternate_02.errors"), 1);
        assert_eq!(wiretap.error_records().len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_sink() {
        let first = Wiretap::new();
        let second = Wiretap::new();
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(RawDataSource::text("a\nb"));
        let a = builder.add_sink(first.clone());
        let b = builder.add_sink(second.clone());
        builder.connect(source, a).connect(source, b);

        let result = Harness::new().run(builder.build("fan-out").unwrap()).await.unwrap();

        assert_eq!(result.output_for("Wiretap_02").len(), 2);
        assert_eq!(result.output_for("Wiretap_03").len(), 2);
        assert_eq!(first.output_records(), second.output_records());
    }

    #[tokio::test]
    async fn test_terminal_failure_becomes_run_failed() {
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(RawDataSource::text("a"));
        let explode = builder.add_processor(Explode);
        let sink = builder.add_sink(Wiretap::new());
        builder.connect(source, explode).connect(explode, sink);

        let err = Harness::new()
            .run(builder.build("explode").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_run_failure());
        assert_eq!(err.error_code(), Some("BOOM_01"));
        assert!(matches!(err, HarnessError::RunFailed { ref stage, .. } if stage == "Explode_02"));
    }

    #[tokio::test]
    async fn test_run_is_bounded() {
        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(Endless);
        let sink = builder.add_sink(Wiretap::new());
        builder.connect(source, sink);

        let err = Harness::new()
            .with_max_wait(Duration::from_millis(100))
            .run(builder.build("endless").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout(d) if d == Duration::from_millis(100)));
    }

    #[test]
    fn test_assertion_mismatch_reports_both_sides() {
        let result = RunResult::new("empty".to_string());
        let err = result.expect_output_count(1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "assertion failed for output records: expected 1, observed 0"
        );
        assert!(result.expect_field(0, "/A", &json!(1)).is_err());
    }
}
