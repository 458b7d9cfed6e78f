//! Scenario files: a mock, a pipeline shape, and a table of expected outcomes.
//!
//! ```yaml
//! name: lookup-contract
//! mock:
//!   rules:
//!     - id: lookup
//!       request:
//!         method: [GET]
//!         path: { type: exact, value: /lookup }
//!       replies:
//!         - status: 200
//!           body: { type: json, content: { A: 1 } }
//!           times: forever
//! source:
//!   raw_data: dummy
//! processor:
//!   resource_url: "{{mock_url}}/lookup"
//! cases:
//!   - name: passthrough
//!     expect:
//!       output_records: 1
//!       error_records: 0
//! ```

use crate::config::{MockConfig, RuleDefinition};
use crate::error::HarnessError;
use crate::harness::{Harness, RunStatus, DEFAULT_MAX_WAIT};
use crate::pipeline::{PipelineBuilder, Record};
use crate::scope::ResourceScope;
use crate::stages::{HttpLookupConfig, HttpLookupProcessor, SourceConfig, Wiretap};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Placeholder replaced by the mock endpoint's base URL.
pub const MOCK_URL_PLACEHOLDER: &str = "{{mock_url}}";

/// A scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Mock endpoint shared by every case (each case gets a fresh instance)
    #[serde(default)]
    pub mock: MockConfig,

    pub source: SourceConfig,

    /// HTTP lookup settings; cases merge their overrides into this
    pub processor: Value,

    #[serde(default)]
    pub max_wait_ms: Option<u64>,

    pub cases: Vec<Case>,
}

/// One row of the expectation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Case {
    pub name: String,

    /// Merged into the scenario's processor settings
    #[serde(default)]
    pub overrides: Value,

    /// Extra rules, matched before the scenario's own
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    pub expect: Expectation,
}

/// Expected outcome; unset fields are not checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub output_records: Option<usize>,
    #[serde(default)]
    pub error_records: Option<usize>,
    #[serde(default)]
    pub stage_errors: Option<usize>,
    /// Code of the run failure, or of the first error record or stage error
    #[serde(default)]
    pub error_code: Option<String>,
    /// Requests received by the mock endpoint
    #[serde(default)]
    pub requests: Option<usize>,
}

/// What a case run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observed {
    pub status: RunStatus,
    pub output_records: usize,
    pub error_records: usize,
    pub stage_errors: usize,
    pub error_code: Option<String>,
    pub requests: usize,
}

/// Result of one case.
#[derive(Debug)]
pub struct CaseReport {
    pub name: String,
    /// `None` when the case could not be run to an outcome
    pub observed: Option<Observed>,
    pub mismatches: Vec<HarnessError>,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl Expectation {
    /// Compare against an observed outcome.
    pub fn check(&self, observed: &Observed) -> Vec<HarnessError> {
        let mut mismatches = Vec::new();
        if let Some(status) = self.status {
            if status != observed.status {
                mismatches.push(HarnessError::assertion(
                    "status",
                    format!("{:?}", status),
                    format!("{:?}", observed.status),
                ));
            }
        }
        let counts = [
            ("output records", self.output_records, observed.output_records),
            ("error records", self.error_records, observed.error_records),
            ("stage errors", self.stage_errors, observed.stage_errors),
            ("requests", self.requests, observed.requests),
        ];
        for (what, expected, observed) in counts {
            if let Some(expected) = expected {
                if expected != observed {
                    mismatches.push(HarnessError::assertion(what, expected, observed));
                }
            }
        }
        if let Some(code) = &self.error_code {
            if observed.error_code.as_deref() != Some(code.as_str()) {
                mismatches.push(HarnessError::assertion(
                    "error code",
                    code,
                    observed.error_code.as_deref().unwrap_or("<none>"),
                ));
            }
        }
        mismatches
    }
}

impl Scenario {
    /// Load and validate a scenario file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let scenario: Self = serde_yaml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Validate the scenario.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.mock.validate()?;
        self.source
            .build()
            .map_err(|e| anyhow::anyhow!("Source raw_data: {}", e))?;
        if self.cases.is_empty() {
            anyhow::bail!("Scenario '{}' has no cases", self.name);
        }

        let mut names = HashSet::new();
        for case in &self.cases {
            if !names.insert(case.name.as_str()) {
                anyhow::bail!("Duplicate case name '{}'", case.name);
            }
            for rule in &case.rules {
                rule.validate()
                    .map_err(|e| anyhow::anyhow!("Case '{}' rule {}: {}", case.name, rule.id, e))?;
            }
            self.processor_config(case, "http://127.0.0.1:1")
                .map_err(|e| anyhow::anyhow!("Case '{}': {}", case.name, e))?;
        }
        Ok(())
    }

    /// Per-run bound.
    pub fn max_wait(&self) -> Duration {
        self.max_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MAX_WAIT)
    }

    /// Processor settings for a case against a given mock URL.
    pub fn processor_config(
        &self,
        case: &Case,
        mock_url: &str,
    ) -> Result<HttpLookupConfig, HarnessError> {
        let mut merged = self.processor.clone();
        merge(&mut merged, &case.overrides);
        substitute(&mut merged, mock_url);
        let config: HttpLookupConfig = serde_json::from_value(merged)
            .map_err(|e| HarnessError::InvalidConfig(format!("processor: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn mock_config(&self, case: &Case) -> MockConfig {
        MockConfig {
            rules: case
                .rules
                .iter()
                .chain(&self.mock.rules)
                .cloned()
                .collect(),
            ..self.mock.clone()
        }
    }

    /// Run one case against a fresh mock endpoint.
    ///
    /// Errors other than a stage failure (a timed out run, a bad setting)
    /// fail the case instead of being returned.
    pub async fn run_case(&self, case: &Case) -> CaseReport {
        let mut scope = ResourceScope::new();
        let observed = self.observe(case, &mut scope).await;
        scope.close().await;

        let (observed, mismatches) = match observed {
            Ok(observed) => {
                let mismatches = case.expect.check(&observed);
                (Some(observed), mismatches)
            }
            Err(err) => (None, vec![err]),
        };
        if mismatches.is_empty() {
            info!(scenario = %self.name, case = %case.name, "Case passed");
        } else {
            for mismatch in &mismatches {
                warn!(scenario = %self.name, case = %case.name, "{}", mismatch);
            }
        }
        CaseReport {
            name: case.name.clone(),
            observed,
            mismatches,
        }
    }

    async fn observe(
        &self,
        case: &Case,
        scope: &mut ResourceScope,
    ) -> Result<Observed, HarnessError> {
        let endpoint = scope.mock_endpoint(self.mock_config(case)).await?;
        let processor = HttpLookupProcessor::new(self.processor_config(case, &endpoint.url())?)?;
        let source = self
            .source
            .build()
            .map_err(|e| HarnessError::InvalidConfig(format!("source: {}", e)))?;

        let mut builder = PipelineBuilder::new();
        let source = builder.add_source(source);
        let lookup = builder.add_processor(processor);
        let tap = builder.add_sink(Wiretap::new());
        builder.connect(source, lookup).connect(lookup, tap);
        let pipeline = builder.build(format!("{}/{}", self.name, case.name))?;

        let outcome = Harness::new()
            .with_max_wait(self.max_wait())
            .run(pipeline)
            .await;
        let requests = endpoint.pending_requests().len();

        match outcome {
            Ok(result) => Ok(Observed {
                status: result.status,
                output_records: result.output_count(),
                error_records: result.error_count(),
                stage_errors: result.stage_errors.len(),
                error_code: result
                    .error_records
                    .iter()
                    .find_map(Record::error_code)
                    .map(String::from)
                    .or_else(|| result.stage_errors.first().map(|e| e.error_code.clone())),
                requests,
            }),
            Err(HarnessError::RunFailed { error_code, .. }) => Ok(Observed {
                status: RunStatus::RunError,
                output_records: 0,
                error_records: 0,
                stage_errors: 0,
                error_code: Some(error_code),
                requests,
            }),
            Err(err) => Err(err),
        }
    }

    /// Run every case, or those whose name contains `filter`.
    pub async fn run_all(&self, filter: Option<&str>) -> Vec<CaseReport> {
        let mut reports = Vec::new();
        for case in &self.cases {
            if filter.is_some_and(|f| !case.name.contains(f)) {
                continue;
            }
            reports.push(self.run_case(case).await);
        }
        reports
    }
}

/// Objects merge key by key; anything else replaces.
fn merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

fn substitute(value: &mut Value, mock_url: &str) {
    match value {
        Value::String(s) if s.contains(MOCK_URL_PLACEHOLDER) => {
            *s = s.replace(MOCK_URL_PLACEHOLDER, mock_url);
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, mock_url)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, mock_url)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const SCENARIO: &str = r#"
name: lookup
mock:
  rules:
    - id: lookup
      request:
        method: [GET]
        path:
          type: exact
          value: /lookup
      replies:
        - status: 200
          body:
            type: json
            content:
              A: 1
          times: forever
source:
  raw_data: dummy
processor:
  resource_url: "{{mock_url}}/lookup"
max_wait_ms: 5000
cases:
  - name: passthrough
    expect:
      status: finished
      output_records: 1
      error_records: 0
      requests: 1
  - name: missing-status-fails-stage
    overrides:
      resource_url: "{{mock_url}}/missing"
      per_status_actions:
        - status_code: 404
          action: stage_error
    expect:
      status: run_error
      error_code: HTTP_14
  - name: case-rule-shadows
    rules:
      - id: empty
        request:
          path:
            type: exact
            value: /lookup
        replies:
          - status: 200
            body:
              type: text
              content: "[]"
    overrides:
      missing_values_behavior: send_to_error
    expect:
      output_records: 0
      error_records: 1
      error_code: HTTP_68
"#;

    #[test]
    fn test_merge_and_substitute() {
        let mut base = json!({"resource_url": "{{mock_url}}/a", "headers": {"X": "1"}});
        merge(&mut base, &json!({"headers": {"Y": "2"}, "request_timeout_ms": 10}));
        substitute(&mut base, "http://127.0.0.1:9");
        assert_eq!(
            base,
            json!({
                "resource_url": "http://127.0.0.1:9/a",
                "headers": {"X": "1", "Y": "2"},
                "request_timeout_ms": 10
            })
        );
    }

    #[test]
    fn test_validate_rejects_bad_scenarios() {
        assert!(Scenario::from_yaml(SCENARIO).is_ok());

        let no_cases = SCENARIO.split("cases:").next().unwrap().to_string() + "cases: []\n";
        assert!(Scenario::from_yaml(&no_cases).is_err());

        let bad_override = SCENARIO.replace("missing_values_behavior: send_to_error", "bogus: 1");
        assert!(Scenario::from_yaml(&bad_override).is_err());
    }

    #[test]
    fn test_expectation_check() {
        let observed = Observed {
            status: RunStatus::Finished,
            output_records: 1,
            error_records: 0,
            stage_errors: 0,
            error_code: None,
            requests: 1,
        };
        let expect = Expectation {
            output_records: Some(1),
            error_records: Some(1),
            error_code: Some("HTTP_01".to_string()),
            ..Expectation::default()
        };
        assert_eq!(expect.check(&observed).len(), 2);
        assert!(Expectation::default().check(&observed).is_empty());
    }

    #[tokio::test]
    async fn test_run_all_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let scenario = Scenario::from_file(file.path()).unwrap();
        let reports = scenario.run_all(None).await;

        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert!(report.passed(), "{}: {:?}", report.name, report.mismatches);
        }
        assert_eq!(
            reports[1].observed.as_ref().map(|o| o.status),
            Some(RunStatus::RunError)
        );

        let filtered = scenario.run_all(Some("passthrough")).await;
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_case_does_not_stop_the_table() {
        let slow = SCENARIO
            .replace("max_wait_ms: 5000", "max_wait_ms: 300")
            .replace(
                "          times: forever\nsource:",
                "          times: forever\n    - id: slow\n      request:\n        path:\n          type: exact\n          value: /slow\n      replies:\n        - status: 200\n          delay:\n            fixed_ms: 2000\n          times: forever\nsource:",
            );
        let mut scenario = Scenario::from_yaml(&slow).unwrap();
        scenario.cases[0].overrides = json!({"resource_url": "{{mock_url}}/slow"});

        let reports = scenario.run_all(None).await;

        assert_eq!(reports.len(), 3);
        assert!(!reports[0].passed());
        assert!(reports[0].observed.is_none());
        assert!(matches!(reports[0].mismatches[0], HarnessError::Timeout(_)));
        assert!(reports[1].passed(), "{:?}", reports[1].mismatches);
        assert!(reports[2].passed(), "{:?}", reports[2].mismatches);
    }
}
