//! Captured requests and the arrival-ordered request log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// A request as the mock endpoint received it.
///
/// Immutable once appended to the log.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    /// Arrival position, starting at 0
    pub sequence: u64,
    /// Upper-case HTTP method
    pub method: String,
    /// Request path without the query string
    pub path: String,
    /// Raw query string, if any
    pub query: Option<String>,
    /// Request headers (first value wins for repeated names)
    pub headers: HashMap<String, String>,
    /// Raw request body
    #[serde(skip)]
    pub body: Vec<u8>,
    /// Id of the rule that answered, if any
    pub rule_id: Option<String>,
    /// Receipt timestamp
    pub received_at: DateTime<Utc>,
}

impl CapturedRequest {
    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body parsed as JSON, if it parses.
    pub fn body_json(&self) -> Option<serde_json::Value> {
        self.body_text().and_then(|s| serde_json::from_str(s).ok())
    }

    /// Header value lookup ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded query parameters.
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query_string(self.query.as_deref().unwrap_or(""))
    }

    /// Whether a rule answered this request.
    pub fn matched(&self) -> bool {
        self.rule_id.is_some()
    }
}

/// Request log kept in arrival order.
#[derive(Debug, Default)]
pub struct RequestLog {
    entries: Vec<CapturedRequest>,
    next_sequence: u64,
}

impl RequestLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Append a request.
    pub fn append(&mut self, request: CapturedRequest) {
        self.entries.push(request);
    }

    /// All entries in arrival order.
    pub fn entries(&self) -> &[CapturedRequest] {
        &self.entries
    }

    /// Number of captured requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries. Sequence numbers keep counting.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Parse a query string into key-value pairs.
pub(crate) fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

/// Decode `%XX` escapes and `+` in a query component.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sequence: u64, body: &str) -> CapturedRequest {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        CapturedRequest {
            sequence,
            method: "POST".to_string(),
            path: "/lookup".to_string(),
            query: Some("city=San%20Francisco&flag".to_string()),
            headers,
            body: body.as_bytes().to_vec(),
            rule_id: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_body_accessors() {
        let req = request(0, r#"{"A": 1}"#);
        assert_eq!(req.body_text(), Some(r#"{"A": 1}"#));
        assert_eq!(req.body_json().unwrap()["A"], 1);
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert!(!req.matched());
    }

    #[test]
    fn test_serializes_without_body() {
        let value = serde_json::to_value(request(4, "secret")).unwrap();
        assert_eq!(value["sequence"], 4);
        assert!(value["received_at"].is_string());
        assert!(value.get("body").is_none());
    }

    #[test]
    fn test_query_params() {
        let params = request(0, "").query_params();
        assert_eq!(params.get("city"), Some(&"San Francisco".to_string()));
        assert_eq!(params.get("flag"), Some(&String::new()));
    }

    #[test]
    fn test_log_keeps_arrival_order() {
        let mut log = RequestLog::new();
        for _ in 0..3 {
            let seq = log.next_sequence();
            log.append(request(seq, ""));
        }
        let sequences: Vec<u64> = log.entries().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.next_sequence(), 3);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("a+b"), "a b");
    }
}
