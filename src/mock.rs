//! The mock endpoint: an HTTP server answering from registered rules.

use crate::capture::{CapturedRequest, RequestLog};
use crate::config::{MockConfig, ReplySpec, ResponseBody, RuleDefinition, Times};
use crate::error::HarnessError;
use crate::matcher::{CompiledMatcher, MatchContext};
use crate::template::{TemplateContext, TemplateEngine};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A registered rule and its position in the reply sequence.
struct RuleSlot {
    definition: RuleDefinition,
    matcher: CompiledMatcher,
    /// Index of the current reply
    cursor: usize,
    /// Requests answered by the current reply so far
    served: u32,
}

impl RuleSlot {
    fn new(definition: RuleDefinition) -> Result<Self, HarnessError> {
        definition
            .validate()
            .map_err(|e| HarnessError::InvalidRule(format!("{}: {}", definition.id, e)))?;
        let matcher = CompiledMatcher::compile(&definition.request)
            .map_err(|e| HarnessError::InvalidRule(format!("{}: {}", definition.id, e)))?;
        Ok(Self {
            definition,
            matcher,
            cursor: 0,
            served: 0,
        })
    }

    fn is_exhausted(&self) -> bool {
        self.cursor >= self.definition.replies.len()
    }

    /// Hand out the current reply and advance the sequence.
    fn consume(&mut self) -> Option<ReplySpec> {
        let reply = self.definition.replies.get(self.cursor)?.clone();
        match reply.times {
            Times::Forever => {}
            Times::Count(n) => {
                self.served += 1;
                if self.served >= n {
                    self.cursor += 1;
                    self.served = 0;
                }
            }
        }
        Some(reply)
    }
}

#[derive(Default)]
struct EndpointState {
    rules: Vec<RuleSlot>,
    log: RequestLog,
}

struct Shared {
    config: MockConfig,
    state: Mutex<EndpointState>,
    templates: TemplateEngine,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        // A panic while holding the lock cannot leave the log half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// A programmable HTTP mock endpoint.
///
/// Every request is appended to the capture log, then answered by the first
/// rule (in registration order) that matches and still has a reply left.
pub struct MockEndpoint {
    shared: Arc<Shared>,
    addr: SocketAddr,
    server: Mutex<Option<ServerHandle>>,
}

impl MockEndpoint {
    /// Bind and start serving.
    pub async fn start(config: MockConfig) -> Result<Self, HarnessError> {
        let rules = config
            .rules
            .iter()
            .cloned()
            .map(RuleSlot::new)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(default) = &config.default_response {
            default
                .validate()
                .map_err(|e| HarnessError::InvalidRule(format!("default response: {}", e)))?;
        }

        let listener = tokio::net::TcpListener::bind(config.settings.bind).await?;
        let addr = listener.local_addr()?;

        info!(
            address = %addr,
            rules = rules.len(),
            "Mock endpoint started"
        );

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(EndpointState {
                rules,
                log: RequestLog::new(),
            }),
            templates: TemplateEngine::new(),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        });

        let app = Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&shared));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "Mock endpoint server error");
            }
        });

        Ok(Self {
            shared,
            addr,
            server: Mutex::new(Some(ServerHandle {
                shutdown: shutdown_tx,
                join,
            })),
        })
    }

    /// Start with no rules.
    pub async fn start_default() -> Result<Self, HarnessError> {
        Self::start(MockConfig::default()).await
    }

    /// Bound socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL, e.g. `http://127.0.0.1:40123`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL for a path on this endpoint.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.url(), path.trim_start_matches('/'))
    }

    /// Append `reply` to the rule with `rule`'s id, or register `rule` last.
    ///
    /// Any replies already carried by `rule` are registered before `reply`.
    /// An existing id must come with the same request matcher.
    pub fn register(&self, rule: RuleDefinition, reply: ReplySpec) -> Result<(), HarnessError> {
        reply
            .validate()
            .map_err(|e| HarnessError::InvalidRule(format!("{}: {}", rule.id, e)))?;

        let mut state = self.shared.lock();
        if let Some(slot) = state
            .rules
            .iter_mut()
            .find(|slot| slot.definition.id == rule.id)
        {
            if slot.definition.request != rule.request {
                return Err(HarnessError::InvalidRule(format!(
                    "{}: already registered with a different request matcher",
                    rule.id
                )));
            }
            slot.definition.replies.extend(rule.replies);
            slot.definition.replies.push(reply);
            debug!(rule_id = %slot.definition.id, replies = slot.definition.replies.len(), "Reply appended");
            return Ok(());
        }

        let slot = RuleSlot::new(rule.reply(reply))?;
        debug!(rule_id = %slot.definition.id, "Rule registered");
        state.rules.push(slot);
        Ok(())
    }

    /// Register a rule together with the replies it carries.
    pub fn register_rule(&self, rule: RuleDefinition) -> Result<(), HarnessError> {
        let slot = RuleSlot::new(rule)?;
        let mut state = self.shared.lock();
        if state
            .rules
            .iter()
            .any(|existing| existing.definition.id == slot.definition.id)
        {
            return Err(HarnessError::InvalidRule(format!(
                "rule '{}' is already registered",
                slot.definition.id
            )));
        }
        debug!(rule_id = %slot.definition.id, "Rule registered");
        state.rules.push(slot);
        Ok(())
    }

    /// Snapshot of every captured request, in arrival order.
    pub fn pending_requests(&self) -> Vec<CapturedRequest> {
        self.shared.lock().log.entries().to_vec()
    }

    /// Captured requests answered by the given rule.
    pub fn requests_for(&self, rule_id: &str) -> Vec<CapturedRequest> {
        self.shared
            .lock()
            .log
            .entries()
            .iter()
            .filter(|r| r.rule_id.as_deref() == Some(rule_id))
            .cloned()
            .collect()
    }

    /// Forget captured requests; rules and their reply positions are kept.
    pub fn reset_requests(&self) {
        self.shared.lock().log.clear();
    }

    /// Whether every reply of the rule has been consumed.
    pub fn is_exhausted(&self, rule_id: &str) -> Option<bool> {
        self.shared
            .lock()
            .rules
            .iter()
            .find(|slot| slot.definition.id == rule_id)
            .map(RuleSlot::is_exhausted)
    }

    /// Total requests received.
    pub fn total_requests(&self) -> u64 {
        self.shared.requests_total.load(Ordering::Relaxed)
    }

    /// Requests answered by a rule.
    pub fn total_matched(&self) -> u64 {
        self.shared.requests_matched.load(Ordering::Relaxed)
    }

    /// Requests answered with the default reply.
    pub fn total_unmatched(&self) -> u64 {
        self.shared.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Whether the server is still running.
    pub fn is_running(&self) -> bool {
        self.server_slot().is_some()
    }

    /// Stop the server and drop rules and captured requests. Idempotent.
    pub async fn teardown(&self) {
        let handle = self.server_slot().take();
        let Some(ServerHandle { shutdown, mut join }) = handle else {
            return;
        };

        let _ = shutdown.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut join).await.is_err() {
            warn!(address = %self.addr, "Mock endpoint did not stop in time, aborting");
            join.abort();
        }

        let mut state = self.shared.lock();
        state.rules.clear();
        state.log.clear();
        info!(address = %self.addr, "Mock endpoint torn down");
    }

    fn server_slot(&self) -> MutexGuard<'_, Option<ServerHandle>> {
        self.server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.server_slot().take() {
            let _ = handle.shutdown.send(());
            handle.join.abort();
        }
    }
}

async fn handle_request(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    shared.requests_total.fetch_add(1, Ordering::Relaxed);

    let mut request = CapturedRequest {
        sequence: 0,
        method: method.as_str().to_uppercase(),
        path: uri.path().to_string(),
        query: uri.query().map(String::from),
        headers: flatten_headers(&headers),
        body: body.to_vec(),
        rule_id: None,
        received_at: Utc::now(),
    };

    // Capture and reply consumption share one critical section so the log
    // order is the order in which replies were handed out.
    let matched = {
        let mut state = shared.lock();
        request.sequence = state.log.next_sequence();

        let found = state.rules.iter_mut().find_map(|slot| {
            if !slot.definition.enabled || slot.is_exhausted() {
                return None;
            }
            let ctx = slot.matcher.matches(&request)?;
            let reply = slot.consume()?;
            Some((slot.definition.id.clone(), reply, ctx))
        });

        request.rule_id = found.as_ref().map(|(id, _, _)| id.clone());
        state.log.append(request.clone());
        found
    };

    let settings = &shared.config.settings;
    match matched {
        Some((rule_id, reply, ctx)) => {
            shared.requests_matched.fetch_add(1, Ordering::Relaxed);
            if settings.log_matches {
                info!(
                    rule_id = %rule_id,
                    method = %request.method,
                    path = %request.path,
                    sequence = request.sequence,
                    status = reply.status,
                    "Request matched rule"
                );
            }

            if let Some(delay) = &reply.delay {
                let delay = delay.calculate();
                if !delay.is_zero() {
                    debug!(rule_id = %rule_id, delay_ms = delay.as_millis() as u64, "Delaying reply");
                    tokio::time::sleep(delay).await;
                }
            }

            build_reply(&shared, &reply, Some((&ctx, &request)))
        }
        None => {
            shared.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            if settings.log_unmatched {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    sequence = request.sequence,
                    "No matching rule"
                );
            }
            match &shared.config.default_response {
                Some(default) => build_reply(&shared, default, None),
                None => not_found(),
            }
        }
    }
}

fn build_reply(
    shared: &Shared,
    reply: &ReplySpec,
    request: Option<(&MatchContext, &CapturedRequest)>,
) -> Response {
    let body = match (&reply.body, request) {
        (None, _) => Vec::new(),
        (Some(body), Some((ctx, req))) if reply.template => {
            render_body(&shared.templates, body, &TemplateContext::new(ctx, req))
        }
        (Some(body), _) => body.to_bytes().unwrap_or_else(|err| {
            warn!(error = %err, "Failed to load reply body");
            Vec::new()
        }),
    };

    let content_type = reply
        .header_value("content-type")
        .map(String::from)
        .or_else(|| reply.body.as_ref().map(|b| b.content_type().to_string()))
        .unwrap_or_else(|| shared.config.settings.default_content_type.clone());

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(axum::http::header::CONTENT_TYPE, value);
    }
    for (name, value) in &reply.headers {
        if name.eq_ignore_ascii_case("content-type") {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid reply header"),
        }
    }

    response
}

fn render_body(engine: &TemplateEngine, body: &ResponseBody, ctx: &TemplateContext) -> Vec<u8> {
    let rendered = match body {
        ResponseBody::Text { content } => engine.render(content, ctx).map(String::into_bytes),
        ResponseBody::Json { content } => engine
            .render_json(content, ctx)
            .map(|v| serde_json::to_vec(&v).unwrap_or_default()),
        _ => return body.to_bytes().unwrap_or_default(),
    };
    rendered.unwrap_or_else(|err| {
        warn!(error = %err, "Template rendering failed, sending empty body");
        Vec::new()
    })
}

fn not_found() -> Response {
    let mut response = Response::new(Body::from(
        r#"{"error": "not_found", "message": "No matching rule found"}"#,
    ));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Keep the first value of each header.
fn flatten_headers(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    let mut flat = std::collections::HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            flat.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    flat
}
