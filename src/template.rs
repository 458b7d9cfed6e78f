//! Template rendering for dynamic reply bodies.
//!
//! Reply bodies marked `template: true` are rendered with Handlebars against
//! the request that triggered them.

use crate::capture::CapturedRequest;
use crate::matcher::MatchContext;
use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Template engine for rendering dynamic replies.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Variables visible to reply templates.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Path parameters from template matching
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path
    pub request_path: String,
    /// Arrival position of the request
    pub sequence: u64,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl TemplateContext {
    /// Build the context for one request.
    pub fn new(match_ctx: &MatchContext, request: &CapturedRequest) -> Self {
        Self {
            path: match_ctx.path_params.clone(),
            query: match_ctx.query_params.clone(),
            headers: request.headers.clone(),
            captures: match_ctx.captures.clone(),
            method: request.method.clone(),
            request_path: request.path.clone(),
            sequence: request.sequence,
            body: request.body_text().map(String::from),
            json: request.body_json(),
        }
    }
}

handlebars_helper!(upper: |s: str| s.to_uppercase());
handlebars_helper!(lower: |s: str| s.to_lowercase());
handlebars_helper!(random: |min: i64, max: i64| {
    use rand::Rng;
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    rand::thread_rng().gen_range(low..=high)
});

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("upper", Box::new(upper));
        handlebars.register_helper("lower", Box::new(lower));
        handlebars.register_helper("random", Box::new(random));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("default", Box::new(default_helper));

        // Reply bodies are JSON or text, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string.
    pub fn render(
        &self,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<String, handlebars::RenderError> {
        self.handlebars.render_template(template, ctx)
    }

    /// Render every string leaf of a JSON value that contains template syntax.
    pub fn render_json(
        &self,
        value: &Value,
        ctx: &TemplateContext,
    ) -> Result<Value, handlebars::RenderError> {
        match value {
            Value::String(s) if s.contains("{{") => Ok(Value::String(self.render(s, ctx)?)),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_json(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: the fallback when the value is null or an
/// empty string.
fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let fallback = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");
    match h.param(0).map(|v| v.value()) {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(Value::Null) | Some(Value::String(_)) | None => out.write(fallback)?,
        Some(other) => out.write(&other.to_string())?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(body: &[u8]) -> CapturedRequest {
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), "test-client".to_string());
        CapturedRequest {
            sequence: 4,
            method: "POST".to_string(),
            path: "/users/123".to_string(),
            query: None,
            headers,
            body: body.to_vec(),
            rule_id: None,
            received_at: Utc::now(),
        }
    }

    fn context(body: &[u8]) -> TemplateContext {
        let mut match_ctx = MatchContext::default();
        match_ctx.path_params.insert("id".to_string(), "123".to_string());
        match_ctx.query_params.insert("page".to_string(), "1".to_string());
        TemplateContext::new(&match_ctx, &request(body))
    }

    #[test]
    fn test_request_variables() {
        let engine = TemplateEngine::new();
        let ctx = context(b"");

        let result = engine
            .render(
                "{{method}} {{request_path}} id={{path.id}} page={{query.page}} seq={{sequence}}",
                &ctx,
            )
            .unwrap();
        assert_eq!(result, "POST /users/123 id=123 page=1 seq=4");

        let result = engine.render("Client: {{headers.user-agent}}", &ctx).unwrap();
        assert_eq!(result, "Client: test-client");
    }

    #[test]
    fn test_request_body_json() {
        let engine = TemplateEngine::new();
        let ctx = context(br#"{"name":"John"}"#);

        let result = engine.render("Name: {{json.name}}", &ctx).unwrap();
        assert_eq!(result, "Name: John");
    }

    #[test]
    fn test_helpers() {
        let engine = TemplateEngine::new();
        let ctx = context(br#"{"name":"John"}"#);

        let result = engine
            .render("{{upper json.name}} {{lower json.name}}", &ctx)
            .unwrap();
        assert_eq!(result, "JOHN john");

        let result = engine
            .render("{{default query.missing \"fallback\"}}", &ctx)
            .unwrap();
        assert_eq!(result, "fallback");

        let value: i64 = engine
            .render("{{random 5 5}}", &ctx)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(value, 5);

        let year = engine.render("{{now \"%Y\"}}", &ctx).unwrap();
        assert_eq!(year.len(), 4);
    }

    #[test]
    fn test_render_json() {
        let engine = TemplateEngine::new();
        let ctx = context(b"");

        let json = serde_json::json!({
            "id": "{{path.id}}",
            "items": ["User {{path.id}}", 7],
            "static": "no template"
        });

        let result = engine.render_json(&json, &ctx).unwrap();
        assert_eq!(result["id"], "123");
        assert_eq!(result["items"][0], "User 123");
        assert_eq!(result["items"][1], 7);
        assert_eq!(result["static"], "no template");
    }
}
