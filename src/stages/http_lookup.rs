//! HTTP lookup processor.
//!
//! Sends one request per record (or per batch) and writes the parsed
//! response into each record. Non-success statuses and timeouts are routed
//! through per-status action policies.

use crate::error::HarnessError;
use crate::pipeline::{Batch, Processor, Record, StageFailure, StageOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Error codes attached to error records and stage errors.
pub mod codes {
    /// Response body could not be parsed
    pub const INVALID_RESPONSE: &str = "HTTP_00";
    /// Non-success status without a passthrough
    pub const STATUS: &str = "HTTP_01";
    /// Connection could not be established
    pub const CONNECTION: &str = "HTTP_03";
    /// Status configured to fail the stage
    pub const STAGE_ERROR: &str = "HTTP_14";
    /// Retries ran out
    pub const RETRIES_EXHAUSTED: &str = "HTTP_19";
    /// Request did not complete in time
    pub const TIMEOUT: &str = "HTTP_67";
    /// Response carried no values
    pub const EMPTY_RESPONSE: &str = "HTTP_68";
}

/// Processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpLookupConfig {
    /// Target URL
    pub resource_url: String,

    #[serde(default = "default_method")]
    pub http_method: String,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Fixed request body
    #[serde(default)]
    pub request_body: Option<String>,

    /// JSON pointer of the record field sent as the request body
    #[serde(default)]
    pub request_field: Option<String>,

    #[serde(default = "default_request_content_type")]
    pub default_request_content_type: String,

    #[serde(default)]
    pub response_format: ResponseFormat,

    /// JSON pointer receiving the parsed response
    #[serde(default = "default_output_field")]
    pub output_field: String,

    #[serde(default)]
    pub multiple_values_behavior: MultipleValuesBehavior,

    #[serde(default)]
    pub missing_values_behavior: MissingValuesBehavior,

    #[serde(default)]
    pub per_status_actions: Vec<PerStatusAction>,

    /// Pass records on for statuses without an action instead of erroring
    #[serde(default)]
    pub records_for_remaining_statuses: bool,

    /// Field under `output_field` receiving the body of a passed-on error response
    #[serde(default = "default_error_response_body_field")]
    pub error_response_body_field: String,

    /// Time allowed to establish the connection
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Time allowed between reads of the response
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Whole-request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Time allowed to process one batch; records still pending are dropped
    #[serde(default)]
    pub batch_wait_time_ms: Option<u64>,

    #[serde(default)]
    pub action_for_timeout: ActionPolicy,

    /// Send a single request for the whole batch
    #[serde(default)]
    pub one_request_per_batch: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_request_content_type() -> String {
    "application/json".to_string()
}

fn default_output_field() -> String {
    "/result".to_string()
}

fn default_error_response_body_field() -> String {
    "outErrorBody".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl HttpLookupConfig {
    /// Defaults for everything but the URL.
    pub fn new(resource_url: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
            http_method: default_method(),
            headers: BTreeMap::new(),
            request_body: None,
            request_field: None,
            default_request_content_type: default_request_content_type(),
            response_format: ResponseFormat::default(),
            output_field: default_output_field(),
            multiple_values_behavior: MultipleValuesBehavior::default(),
            missing_values_behavior: MissingValuesBehavior::default(),
            per_status_actions: Vec::new(),
            records_for_remaining_statuses: false,
            error_response_body_field: default_error_response_body_field(),
            connect_timeout_ms: None,
            read_timeout_ms: None,
            request_timeout_ms: default_request_timeout_ms(),
            batch_wait_time_ms: None,
            action_for_timeout: ActionPolicy::default(),
            one_request_per_batch: false,
        }
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        reqwest::Url::parse(&self.resource_url).map_err(|e| {
            HarnessError::InvalidConfig(format!("resource_url '{}': {}", self.resource_url, e))
        })?;
        reqwest::Method::from_bytes(self.http_method.to_uppercase().as_bytes()).map_err(|_| {
            HarnessError::InvalidConfig(format!("http_method '{}'", self.http_method))
        })?;
        if !self.output_field.is_empty() && !self.output_field.starts_with('/') {
            return Err(HarnessError::InvalidConfig(format!(
                "output_field '{}' must be a JSON pointer",
                self.output_field
            )));
        }
        if self.error_response_body_field.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "error_response_body_field cannot be empty".to_string(),
            ));
        }
        if let Some(action) = self
            .per_status_actions
            .iter()
            .find(|a| (200..300).contains(&a.status_code))
        {
            return Err(HarnessError::InvalidConfig(format!(
                "per-status action for success status {}",
                action.status_code
            )));
        }
        Ok(())
    }
}

/// How the response body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Json,
    Text,
}

/// What to do when the response holds several values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultipleValuesBehavior {
    #[default]
    FirstOnly,
    AllAsList,
    SplitIntoMultipleRecords,
}

/// What to do when the response holds no values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuesBehavior {
    #[default]
    PassRecordOn,
    SendToError,
}

/// Action taken for a status or a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Retry,
    ErrorRecord,
    StageError,
}

/// An action plus its retry and passthrough settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPolicy {
    pub action: ResponseAction,

    #[serde(default)]
    pub max_retries: u32,

    /// Fixed wait between retries
    #[serde(default)]
    pub backoff_interval_ms: u64,

    /// Pass the record on (with a stage error) instead of producing an error
    /// record once the action gives up
    #[serde(default)]
    pub pass_record: bool,
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self {
            action: ResponseAction::ErrorRecord,
            max_retries: 0,
            backoff_interval_ms: 0,
            pass_record: false,
        }
    }
}

/// Policy bound to one response status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerStatusAction {
    pub status_code: u16,

    #[serde(flatten)]
    pub policy: ActionPolicy,
}

enum Attempt {
    Response { status: u16, body: String },
    Timeout(String),
    Connection(String),
}

/// Calls an HTTP endpoint for each record.
pub struct HttpLookupProcessor {
    config: HttpLookupConfig,
    method: reqwest::Method,
    client: reqwest::Client,
}

impl HttpLookupProcessor {
    pub fn new(config: HttpLookupConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let method = reqwest::Method::from_bytes(config.http_method.to_uppercase().as_bytes())
            .map_err(|_| HarnessError::InvalidConfig(format!("http_method '{}'", config.http_method)))?;
        let mut client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms));
        if let Some(ms) = config.connect_timeout_ms {
            client = client.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = config.read_timeout_ms {
            client = client.read_timeout(Duration::from_millis(ms));
        }
        let client = client.build()?;
        Ok(Self {
            config,
            method,
            client,
        })
    }

    pub fn config(&self) -> &HttpLookupConfig {
        &self.config
    }

    /// One JSON array for the whole batch: the `request_field` values, or the
    /// record roots. A fixed `request_body` is sent unchanged.
    fn batch_body(&self, batch: &[Record]) -> Option<String> {
        let values: Vec<Value> = match (&self.config.request_field, &self.config.request_body) {
            (Some(pointer), _) => batch
                .iter()
                .filter_map(|r| r.field(pointer).cloned())
                .collect(),
            (None, Some(body)) => return Some(body.clone()),
            (None, None) => batch.iter().map(|r| r.value.clone()).collect(),
        };
        Some(Value::Array(values).to_string())
    }

    fn request_body(&self, record: &Record) -> Option<String> {
        match &self.config.request_field {
            Some(pointer) => record.field(pointer).map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            None => self.config.request_body.clone(),
        }
    }

    async fn send(&self, body: Option<String>) -> Attempt {
        let mut request = self
            .client
            .request(self.method.clone(), &self.config.resource_url);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            let has_content_type = self
                .config
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            if !has_content_type {
                request = request.header(
                    reqwest::header::CONTENT_TYPE,
                    self.config.default_request_content_type.as_str(),
                );
            }
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Attempt::Timeout(err.to_string()),
            Err(err) => return Attempt::Connection(err.to_string()),
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => Attempt::Response { status, body },
            Err(err) if err.is_timeout() => Attempt::Timeout(err.to_string()),
            Err(err) => Attempt::Connection(err.to_string()),
        }
    }

    fn status_policy(&self, status: u16) -> Option<&ActionPolicy> {
        self.config
            .per_status_actions
            .iter()
            .find(|a| a.status_code == status)
            .map(|a| &a.policy)
    }

    /// Resolve one request for a group of records sharing it.
    async fn lookup(
        &self,
        group: Vec<Record>,
        body: Option<String>,
        out: &mut StageOutput,
    ) -> Result<(), StageFailure> {
        let mut retries = 0u32;
        loop {
            let (policy, error_code, fail_code, message) = match self.send(body.clone()).await {
                Attempt::Response { status, body } if (200..300).contains(&status) => {
                    self.apply_response(group, &body, out);
                    return Ok(());
                }
                Attempt::Response { status, body } => match self.status_policy(status) {
                    Some(policy) => (
                        policy,
                        codes::STATUS,
                        codes::STAGE_ERROR,
                        format!("Resource returned status {}", status),
                    ),
                    None if self.config.records_for_remaining_statuses => {
                        let field = format!(
                            "{}/{}",
                            self.config.output_field.trim_end_matches('/'),
                            self.config.error_response_body_field
                        );
                        out.records
                            .extend(with_field(group, &field, &Value::String(body)));
                        return Ok(());
                    }
                    None => {
                        let message = format!("Resource returned status {}", status);
                        push_errors(out, group, codes::STATUS, &message);
                        return Ok(());
                    }
                },
                Attempt::Timeout(message) => (
                    &self.config.action_for_timeout,
                    codes::TIMEOUT,
                    codes::TIMEOUT,
                    message,
                ),
                Attempt::Connection(message) => {
                    warn!(url = %self.config.resource_url, error = %message, "Lookup request failed");
                    push_errors(out, group, codes::CONNECTION, &message);
                    return Ok(());
                }
            };

            match policy.action {
                ResponseAction::StageError => return Err(StageFailure::new(fail_code, message)),
                ResponseAction::Retry if retries < policy.max_retries => {
                    retries += 1;
                    debug!(
                        url = %self.config.resource_url,
                        attempt = retries,
                        max_retries = policy.max_retries,
                        "Retrying lookup"
                    );
                    if policy.backoff_interval_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(policy.backoff_interval_ms)).await;
                    }
                }
                ResponseAction::Retry => {
                    give_up(out, group, policy, codes::RETRIES_EXHAUSTED, &message);
                    return Ok(());
                }
                ResponseAction::ErrorRecord => {
                    give_up(out, group, policy, error_code, &message);
                    return Ok(());
                }
            }
        }
    }

    fn apply_response(&self, group: Vec<Record>, body: &str, out: &mut StageOutput) {
        let parsed = match self.parse_body(body) {
            Ok(parsed) => parsed,
            Err(message) => {
                push_errors(out, group, codes::INVALID_RESPONSE, &message);
                return;
            }
        };

        let field = self.config.output_field.as_str();
        match parsed {
            None => match self.config.missing_values_behavior {
                MissingValuesBehavior::PassRecordOn => out.records.extend(group),
                MissingValuesBehavior::SendToError => {
                    push_errors(out, group, codes::EMPTY_RESPONSE, "Response contained no values")
                }
            },
            Some(Value::Array(items)) => match self.config.multiple_values_behavior {
                MultipleValuesBehavior::FirstOnly => {
                    let first = items.into_iter().next().unwrap_or(Value::Null);
                    out.records.extend(with_field(group, field, &first));
                }
                MultipleValuesBehavior::AllAsList => {
                    out.records
                        .extend(with_field(group, field, &Value::Array(items)));
                }
                MultipleValuesBehavior::SplitIntoMultipleRecords => {
                    for record in group {
                        for item in &items {
                            let mut split = record.clone();
                            split.set_field(field, item.clone());
                            out.records.push(split);
                        }
                    }
                }
            },
            Some(value) => out.records.extend(with_field(group, field, &value)),
        }
    }

    /// `Ok(None)` when the body carries no values.
    fn parse_body(&self, body: &str) -> Result<Option<Value>, String> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match self.config.response_format {
            ResponseFormat::Text => Ok(Some(Value::String(body.to_string()))),
            ResponseFormat::Json => {
                let mut values = serde_json::Deserializer::from_str(trimmed)
                    .into_iter::<Value>()
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| format!("Invalid JSON response: {}", e))?;
                let value = if values.len() == 1 {
                    values.remove(0)
                } else {
                    Value::Array(values)
                };
                Ok(match value {
                    Value::Null => None,
                    Value::Array(items) if items.is_empty() => None,
                    other => Some(other),
                })
            }
        }
    }
}

fn with_field<'a>(
    group: Vec<Record>,
    field: &'a str,
    value: &'a Value,
) -> impl Iterator<Item = Record> + 'a {
    group.into_iter().map(move |mut record| {
        record.set_field(field, value.clone());
        record
    })
}

fn push_errors(out: &mut StageOutput, group: Vec<Record>, code: &str, message: &str) {
    out.error_records
        .extend(group.into_iter().map(|r| r.into_error(code, message)));
}

fn give_up(
    out: &mut StageOutput,
    group: Vec<Record>,
    policy: &ActionPolicy,
    code: &str,
    message: &str,
) {
    if policy.pass_record {
        out.records.extend(group);
        out.stage_errors.push(StageFailure::new(code, message));
    } else {
        push_errors(out, group, code, message);
    }
}

#[async_trait]
impl Processor for HttpLookupProcessor {
    fn name(&self) -> &str {
        "HTTPClient"
    }

    async fn process(&self, batch: Batch) -> Result<StageOutput, StageFailure> {
        let mut out = StageOutput::default();
        if batch.is_empty() {
            return Ok(out);
        }

        let groups: Vec<(Vec<Record>, Option<String>)> = if self.config.one_request_per_batch {
            let body = self.batch_body(&batch);
            vec![(batch, body)]
        } else {
            batch
                .into_iter()
                .map(|record| {
                    let body = self.request_body(&record);
                    (vec![record], body)
                })
                .collect()
        };

        let deadline = self
            .config
            .batch_wait_time_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        for (group, body) in groups {
            let Some(deadline) = deadline else {
                self.lookup(group, body, &mut out).await?;
                continue;
            };
            match tokio::time::timeout_at(deadline, self.lookup(group, body, &mut out)).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    // Pending records are dropped, whatever the timeout action.
                    warn!(
                        url = %self.config.resource_url,
                        batch_wait_time_ms = ?self.config.batch_wait_time_ms,
                        "Batch wait time exceeded"
                    );
                    out.stage_errors.push(StageFailure::new(
                        codes::TIMEOUT,
                        "Batch wait time exceeded",
                    ));
                    break;
                }
            }
        }
        Ok(out)
    }
}
