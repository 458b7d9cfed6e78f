//! Configuration for the mock endpoint.
//!
//! Defines mock rules, their sequenced reply specs, and endpoint settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for a mock endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    /// Rules in registration order
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    /// Endpoint settings
    #[serde(default)]
    pub settings: EndpointSettings,

    /// Reply used when no rule matches
    #[serde(default)]
    pub default_response: Option<ReplySpec>,
}

impl MockConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("Rule {} ({}): {}", i, rule.id, e))?;
        }
        if let Some(default) = &self.default_response {
            default
                .validate()
                .map_err(|e| anyhow::anyhow!("Default response: {}", e))?;
        }
        Ok(())
    }
}

/// A mock rule: a request matcher plus the replies it hands out in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Identifier used in logs and in the capture log
    pub id: String,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Request matcher
    pub request: RequestMatcher,

    /// Replies, consumed strictly in this order
    #[serde(default)]
    pub replies: Vec<ReplySpec>,

    /// Whether this rule takes part in matching
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RuleDefinition {
    /// Create a rule with the given id and matcher and no replies yet.
    pub fn new(id: impl Into<String>, request: RequestMatcher) -> Self {
        Self {
            id: id.into(),
            name: None,
            request,
            replies: Vec::new(),
            enabled: true,
        }
    }

    /// Build a rule from the compact `"METHOD /path"` form.
    ///
    /// The id defaults to the rule text itself.
    pub fn when(rule: &str) -> anyhow::Result<Self> {
        let mut parts = rule.split_whitespace();
        let (method, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), None) => (method, path),
            (Some(path), None, None) if path.starts_with('/') => ("", path),
            _ => anyhow::bail!("Rule must look like 'METHOD /path', got '{}'", rule),
        };
        if !path.starts_with('/') {
            anyhow::bail!("Rule path must start with '/', got '{}'", path);
        }

        let request = RequestMatcher {
            method: if method.is_empty() {
                vec![]
            } else {
                vec![method.to_uppercase()]
            },
            path: Some(PathMatcher::Exact {
                value: path.to_string(),
            }),
            ..RequestMatcher::default()
        };
        Ok(Self::new(rule.trim(), request))
    }

    /// Replace the rule id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Require the request body to satisfy `body`.
    pub fn with_body(mut self, body: BodyMatcher) -> Self {
        self.request.body = Some(body);
        self
    }

    /// Require a header to satisfy `matcher`.
    pub fn with_header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.request.headers.insert(name.into(), matcher);
        self
    }

    /// Append a reply to the sequence.
    pub fn reply(mut self, reply: ReplySpec) -> Self {
        self.replies.push(reply);
        self
    }

    /// Validate the rule.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Rule id cannot be empty");
        }
        self.request.validate()?;
        for (i, reply) in self.replies.iter().enumerate() {
            reply
                .validate()
                .map_err(|e| anyhow::anyhow!("Reply {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// Request matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method(s) to match (empty = any)
    #[serde(default)]
    pub method: Vec<String>,

    /// Path matching
    #[serde(default)]
    pub path: Option<PathMatcher>,

    /// Query parameter matching
    #[serde(default)]
    pub query: HashMap<String, QueryMatcher>,

    /// Header matching
    #[serde(default)]
    pub headers: HashMap<String, HeaderMatcher>,

    /// Body matching
    #[serde(default)]
    pub body: Option<BodyMatcher>,
}

impl RequestMatcher {
    /// Validate the request matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            path.validate()?;
        }
        for (name, query) in &self.query {
            if let QueryMatcher::Regex { pattern } = query {
                check_regex(pattern).map_err(|e| anyhow::anyhow!("Query '{}': {}", name, e))?;
            }
        }
        for (name, header) in &self.headers {
            if let HeaderMatcher::Regex { pattern } = header {
                check_regex(pattern).map_err(|e| anyhow::anyhow!("Header '{}': {}", name, e))?;
            }
        }
        if let Some(BodyMatcher::Regex { pattern }) = &self.body {
            check_regex(pattern).map_err(|e| anyhow::anyhow!("Body: {}", e))?;
        }
        Ok(())
    }
}

fn check_regex(pattern: &str) -> anyhow::Result<()> {
    regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
    Ok(())
}

/// Path matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatcher {
    /// Exact path match
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

impl PathMatcher {
    /// Validate the path matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            PathMatcher::Regex { pattern } => check_regex(pattern)?,
            PathMatcher::Glob { pattern } => {
                globset::Glob::new(pattern).map_err(|e| anyhow::anyhow!("Invalid glob: {}", e))?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// Body matching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyMatcher {
    /// Exact body match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path expressions and the values they must resolve to
    JsonPath {
        expressions: HashMap<String, serde_json::Value>,
    },
    /// Body must contain substring
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be empty
    Empty,
}

/// How many matching requests a reply answers before the next one takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimesRepr", into = "TimesRepr")]
pub enum Times {
    /// Answer exactly this many requests
    Count(u32),
    /// Never exhausted
    Forever,
}

impl Default for Times {
    fn default() -> Self {
        Times::Count(1)
    }
}

impl fmt::Display for Times {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Times::Count(n) => write!(f, "{}", n),
            Times::Forever => f.write_str("forever"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TimesRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<TimesRepr> for Times {
    type Error = String;

    fn try_from(repr: TimesRepr) -> Result<Self, Self::Error> {
        match repr {
            TimesRepr::Count(0) => Err("times must be at least 1".to_string()),
            TimesRepr::Count(n) => Ok(Times::Count(n)),
            TimesRepr::Keyword(word) if word.eq_ignore_ascii_case("forever") => Ok(Times::Forever),
            TimesRepr::Keyword(word) => Err(format!("expected a count or 'forever', got '{}'", word)),
        }
    }
}

impl From<Times> for TimesRepr {
    fn from(times: Times) -> Self {
        match times {
            Times::Count(n) => TimesRepr::Count(n),
            Times::Forever => TimesRepr::Keyword("forever".to_string()),
        }
    }
}

/// A canned reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplySpec {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Reply headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Reply body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Render the body through the template engine
    #[serde(default)]
    pub template: bool,

    /// Delay before replying
    #[serde(default)]
    pub delay: Option<DelayConfig>,

    /// Number of requests this reply answers
    #[serde(default)]
    pub times: Times,
}

fn default_status() -> u16 {
    200
}

impl Default for ReplySpec {
    fn default() -> Self {
        Self::status(default_status())
    }
}

impl ReplySpec {
    /// An empty reply with the given status, answering one request.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: None,
            template: false,
            delay: None,
            times: Times::default(),
        }
    }

    /// Set a JSON body.
    pub fn json(mut self, content: serde_json::Value) -> Self {
        self.body = Some(ResponseBody::Json { content });
        self
    }

    /// Set a plain text body.
    pub fn text(mut self, content: impl Into<String>) -> Self {
        self.body = Some(ResponseBody::Text {
            content: content.into(),
        });
        self
    }

    /// Add a reply header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Render the body as a template.
    pub fn templated(mut self) -> Self {
        self.template = true;
        self
    }

    /// Wait this long before replying.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(DelayConfig {
            fixed_ms: delay.as_millis() as u64,
            min_ms: 0,
            max_ms: 0,
        });
        self
    }

    /// Answer `n` requests.
    pub fn times(mut self, n: u32) -> Self {
        self.times = Times::Count(n.max(1));
        self
    }

    /// Never exhaust this reply.
    pub fn forever(mut self) -> Self {
        self.times = Times::Forever;
        self
    }

    /// Validate the reply.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        if let Some(ResponseBody::Base64 { content }) = &self.body {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))?;
        }
        Ok(())
    }

    /// Header value lookup ignoring case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reply body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_vec(content)?),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } | ResponseBody::File { .. } => "application/octet-stream",
        }
    }
}

/// Delay before a reply is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> Duration {
        if self.fixed_ms > 0 {
            return Duration::from_millis(self.fixed_ms);
        }
        if self.max_ms > self.min_ms {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            return Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms));
        }
        Duration::from_millis(self.min_ms)
    }
}

/// Endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSettings {
    /// Address to bind; port 0 picks a free port
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Log every matched request
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type used when neither headers nor body decide it
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_content_type() -> String {
    "application/json".to_string()
}
