//! Request matching logic.
//!
//! Each rule's matcher is compiled once at registration and then evaluated
//! against captured requests.

use crate::capture::CapturedRequest;
use crate::config::{BodyMatcher, HeaderMatcher, PathMatcher, QueryMatcher, RequestMatcher};
use jsonpath_rust::JsonPath;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// A request matcher with its patterns compiled.
pub struct CompiledMatcher {
    methods: Vec<String>,
    path: Option<CompiledPathMatcher>,
    query: Vec<(String, ValueMatcher)>,
    headers: Vec<(String, ValueMatcher)>,
    body: Option<CompiledBodyMatcher>,
}

enum CompiledPathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
    Template(PathTemplate),
}

enum ValueMatcher {
    Exact(String),
    Regex(Regex),
    Contains(String),
    Present,
    Absent,
}

enum CompiledBodyMatcher {
    Exact(String),
    Regex(Regex),
    JsonPath(Vec<(JsonPath, Value)>),
    Contains(String),
    Json,
    Empty,
}

/// A `/users/{id}` style template, matched segment by segment.
struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let segments = template
            .split('/')
            .map(|segment| {
                match segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) if !name.is_empty() => TemplateSegment::Param(name.to_string()),
                    _ => TemplateSegment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                TemplateSegment::Literal(lit) if lit == part => {}
                TemplateSegment::Literal(_) => return None,
                TemplateSegment::Param(_) if part.is_empty() => return None,
                TemplateSegment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

impl CompiledMatcher {
    /// Compile a request matcher.
    pub fn compile(matcher: &RequestMatcher) -> anyhow::Result<Self> {
        let path = match &matcher.path {
            None => None,
            Some(PathMatcher::Exact { value }) => Some(CompiledPathMatcher::Exact(value.clone())),
            Some(PathMatcher::Prefix { value }) => Some(CompiledPathMatcher::Prefix(value.clone())),
            Some(PathMatcher::Regex { pattern }) => {
                Some(CompiledPathMatcher::Regex(Regex::new(pattern)?))
            }
            Some(PathMatcher::Glob { pattern }) => Some(CompiledPathMatcher::Glob(
                globset::Glob::new(pattern)?.compile_matcher(),
            )),
            Some(PathMatcher::Template { template }) => {
                Some(CompiledPathMatcher::Template(PathTemplate::parse(template)))
            }
        };

        let query = matcher
            .query
            .iter()
            .map(|(name, qm)| {
                let compiled = match qm {
                    QueryMatcher::Exact { value } => ValueMatcher::Exact(value.clone()),
                    QueryMatcher::Regex { pattern } => ValueMatcher::Regex(Regex::new(pattern)?),
                    QueryMatcher::Present => ValueMatcher::Present,
                    QueryMatcher::Absent => ValueMatcher::Absent,
                };
                Ok((name.clone(), compiled))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let headers = matcher
            .headers
            .iter()
            .map(|(name, hm)| {
                let compiled = match hm {
                    HeaderMatcher::Exact { value } => ValueMatcher::Exact(value.clone()),
                    HeaderMatcher::Regex { pattern } => ValueMatcher::Regex(Regex::new(pattern)?),
                    HeaderMatcher::Present => ValueMatcher::Present,
                    HeaderMatcher::Absent => ValueMatcher::Absent,
                    HeaderMatcher::Contains { value } => ValueMatcher::Contains(value.clone()),
                };
                Ok((name.clone(), compiled))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let body = match &matcher.body {
            None => None,
            Some(BodyMatcher::Exact { value }) => Some(CompiledBodyMatcher::Exact(value.clone())),
            Some(BodyMatcher::Regex { pattern }) => {
                Some(CompiledBodyMatcher::Regex(Regex::new(pattern)?))
            }
            Some(BodyMatcher::JsonPath { expressions }) => {
                let compiled = expressions
                    .iter()
                    .map(|(expr, expected)| {
                        let path = JsonPath::try_from(expr.as_str())
                            .map_err(|e| anyhow::anyhow!("Invalid JSON path '{}': {}", expr, e))?;
                        Ok((path, expected.clone()))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Some(CompiledBodyMatcher::JsonPath(compiled))
            }
            Some(BodyMatcher::Contains { value }) => {
                Some(CompiledBodyMatcher::Contains(value.clone()))
            }
            Some(BodyMatcher::Json) => Some(CompiledBodyMatcher::Json),
            Some(BodyMatcher::Empty) => Some(CompiledBodyMatcher::Empty),
        };

        Ok(Self {
            methods: matcher.method.iter().map(|m| m.to_uppercase()).collect(),
            path,
            query,
            headers,
            body,
        })
    }

    /// Check a request against this matcher.
    pub fn matches(&self, request: &CapturedRequest) -> Option<MatchContext> {
        let mut context = MatchContext::default();

        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == &request.method) {
            return None;
        }

        if let Some(path_matcher) = &self.path {
            if !matches_path(path_matcher, &request.path, &mut context) {
                return None;
            }
        }

        context.query_params = request.query_params();
        for (name, matcher) in &self.query {
            if !matcher.matches(context.query_params.get(name).map(String::as_str)) {
                return None;
            }
        }

        for (name, matcher) in &self.headers {
            if !matcher.matches(request.header(name)) {
                return None;
            }
        }

        if let Some(body_matcher) = &self.body {
            if !body_matcher.matches(&request.body) {
                return None;
            }
        }

        Some(context)
    }
}

fn matches_path(matcher: &CompiledPathMatcher, path: &str, context: &mut MatchContext) -> bool {
    match matcher {
        CompiledPathMatcher::Exact(value) => path == value,
        CompiledPathMatcher::Prefix(value) => path.starts_with(value.as_str()),
        CompiledPathMatcher::Regex(regex) => {
            let Some(captures) = regex.captures(path) else {
                return false;
            };
            for (i, cap) in captures.iter().enumerate().skip(1) {
                if let Some(m) = cap {
                    context.captures.insert(i.to_string(), m.as_str().to_string());
                }
            }
            for name in regex.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    context.captures.insert(name.to_string(), m.as_str().to_string());
                }
            }
            true
        }
        CompiledPathMatcher::Glob(glob) => glob.is_match(path),
        CompiledPathMatcher::Template(template) => match template.matches(path) {
            Some(params) => {
                context.path_params = params;
                true
            }
            None => false,
        },
    }
}

impl ValueMatcher {
    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (ValueMatcher::Present, found) => found.is_some(),
            (ValueMatcher::Absent, found) => found.is_none(),
            (_, None) => false,
            (ValueMatcher::Exact(expected), Some(v)) => v == expected,
            (ValueMatcher::Regex(regex), Some(v)) => regex.is_match(v),
            (ValueMatcher::Contains(needle), Some(v)) => v.contains(needle.as_str()),
        }
    }
}

impl CompiledBodyMatcher {
    fn matches(&self, body: &[u8]) -> bool {
        if let CompiledBodyMatcher::Empty = self {
            return body.is_empty();
        }

        let Ok(text) = std::str::from_utf8(body) else {
            return false;
        };

        match self {
            CompiledBodyMatcher::Exact(value) => text == value,
            CompiledBodyMatcher::Regex(regex) => regex.is_match(text),
            CompiledBodyMatcher::Contains(value) => text.contains(value.as_str()),
            CompiledBodyMatcher::Json => serde_json::from_str::<Value>(text).is_ok(),
            CompiledBodyMatcher::JsonPath(expressions) => {
                match serde_json::from_str::<Value>(text) {
                    Ok(json) => expressions
                        .iter()
                        .all(|(path, expected)| json_path_matches(path, &json, expected)),
                    Err(_) => false,
                }
            }
            CompiledBodyMatcher::Empty => body.is_empty(),
        }
    }
}

/// A null expectation only requires the path to resolve; otherwise the single
/// result (or the full result list) must equal the expectation.
fn json_path_matches(path: &JsonPath, json: &Value, expected: &Value) -> bool {
    let found = path.find(json);
    let results: &[Value] = match &found {
        Value::Array(items) => items.as_slice(),
        Value::Null => &[],
        other => std::slice::from_ref(other),
    };

    if expected.is_null() {
        return !results.is_empty();
    }
    match results {
        [single] => single == expected || &found == expected,
        _ => &found == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(method: &str, path: &str, query: Option<&str>, body: &[u8]) -> CapturedRequest {
        CapturedRequest {
            sequence: 0,
            method: method.to_string(),
            path: path.to_string(),
            query: query.map(String::from),
            headers: HashMap::new(),
            body: body.to_vec(),
            rule_id: None,
            received_at: Utc::now(),
        }
    }

    fn path_matcher(path: PathMatcher) -> CompiledMatcher {
        CompiledMatcher::compile(&RequestMatcher {
            path: Some(path),
            ..RequestMatcher::default()
        })
        .unwrap()
    }

    #[test]
    fn test_exact_path_matching() {
        let matcher = path_matcher(PathMatcher::Exact {
            value: "/api/users".to_string(),
        });

        assert!(matcher.matches(&request("GET", "/api/users", None, b"")).is_some());
        assert!(matcher.matches(&request("GET", "/api/posts", None, b"")).is_none());
    }

    #[test]
    fn test_prefix_and_glob_matching() {
        let prefix = path_matcher(PathMatcher::Prefix {
            value: "/api/".to_string(),
        });
        assert!(prefix.matches(&request("GET", "/api/posts/123", None, b"")).is_some());
        assert!(prefix.matches(&request("GET", "/other", None, b"")).is_none());

        let glob = path_matcher(PathMatcher::Glob {
            pattern: "/files/*.json".to_string(),
        });
        assert!(glob.matches(&request("GET", "/files/a.json", None, b"")).is_some());
        assert!(glob.matches(&request("GET", "/files/a.csv", None, b"")).is_none());
    }

    #[test]
    fn test_template_path_matching() {
        let matcher = path_matcher(PathMatcher::Template {
            template: "/users/{id}/orders".to_string(),
        });

        let ctx = matcher
            .matches(&request("GET", "/users/123/orders", None, b""))
            .unwrap();
        assert_eq!(ctx.path_params.get("id"), Some(&"123".to_string()));

        assert!(matcher.matches(&request("GET", "/users//orders", None, b"")).is_none());
        assert!(matcher.matches(&request("GET", "/users/123", None, b"")).is_none());
    }

    #[test]
    fn test_regex_captures() {
        let matcher = path_matcher(PathMatcher::Regex {
            pattern: r"^/page/(?P<page>\d+)$".to_string(),
        });

        let ctx = matcher.matches(&request("GET", "/page/4", None, b"")).unwrap();
        assert_eq!(ctx.captures.get("page"), Some(&"4".to_string()));
        assert_eq!(ctx.captures.get("1"), Some(&"4".to_string()));
    }

    #[test]
    fn test_method_matching_is_case_insensitive() {
        let matcher = CompiledMatcher::compile(&RequestMatcher {
            method: vec!["get".to_string(), "POST".to_string()],
            ..RequestMatcher::default()
        })
        .unwrap();

        assert!(matcher.matches(&request("GET", "/", None, b"")).is_some());
        assert!(matcher.matches(&request("DELETE", "/", None, b"")).is_none());
    }

    #[test]
    fn test_query_matching() {
        let mut query = HashMap::new();
        query.insert(
            "page".to_string(),
            QueryMatcher::Exact {
                value: "1".to_string(),
            },
        );
        query.insert("debug".to_string(), QueryMatcher::Absent);
        let matcher = CompiledMatcher::compile(&RequestMatcher {
            query,
            ..RequestMatcher::default()
        })
        .unwrap();

        assert!(matcher.matches(&request("GET", "/", Some("page=1"), b"")).is_some());
        assert!(matcher.matches(&request("GET", "/", Some("page=2"), b"")).is_none());
        assert!(matcher
            .matches(&request("GET", "/", Some("page=1&debug=on"), b""))
            .is_none());
    }

    #[test]
    fn test_header_matching() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), HeaderMatcher::Present);
        let matcher = CompiledMatcher::compile(&RequestMatcher {
            headers,
            ..RequestMatcher::default()
        })
        .unwrap();

        let mut req = request("GET", "/", None, b"");
        assert!(matcher.matches(&req).is_none());

        req.headers
            .insert("Authorization".to_string(), "Bearer token".to_string());
        assert!(matcher.matches(&req).is_some());
    }

    #[test]
    fn test_body_matching() {
        let exact = CompiledMatcher::compile(&RequestMatcher {
            body: Some(BodyMatcher::Exact {
                value: r#"{"city": "San Francisco"}"#.to_string(),
            }),
            ..RequestMatcher::default()
        })
        .unwrap();
        assert!(exact
            .matches(&request("POST", "/", None, br#"{"city": "San Francisco"}"#))
            .is_some());
        assert!(exact.matches(&request("POST", "/", None, b"{}")).is_none());

        let json = CompiledMatcher::compile(&RequestMatcher {
            body: Some(BodyMatcher::Json),
            ..RequestMatcher::default()
        })
        .unwrap();
        assert!(json.matches(&request("POST", "/", None, b"not json")).is_none());

        let empty = CompiledMatcher::compile(&RequestMatcher {
            body: Some(BodyMatcher::Empty),
            ..RequestMatcher::default()
        })
        .unwrap();
        assert!(empty.matches(&request("GET", "/", None, b"")).is_some());
        assert!(empty.matches(&request("GET", "/", None, b"x")).is_none());
    }

    #[test]
    fn test_body_json_path_matching() {
        let mut expressions = HashMap::new();
        expressions.insert("$.city".to_string(), serde_json::json!("San Francisco"));
        let matcher = CompiledMatcher::compile(&RequestMatcher {
            body: Some(BodyMatcher::JsonPath { expressions }),
            ..RequestMatcher::default()
        })
        .unwrap();

        assert!(matcher
            .matches(&request("POST", "/", None, br#"{"city": "San Francisco"}"#))
            .is_some());
        assert!(matcher
            .matches(&request("POST", "/", None, br#"{"city": "Oakland"}"#))
            .is_none());
    }

    #[test]
    fn test_compile_rejects_invalid_regex() {
        let result = CompiledMatcher::compile(&RequestMatcher {
            path: Some(PathMatcher::Regex {
                pattern: "([".to_string(),
            }),
            ..RequestMatcher::default()
        });
        assert!(result.is_err());
    }
}
