//! Error types for the harness.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to tests by the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A stage reached a terminal error; the run did not finish.
    #[error("run failed at stage {stage}: {error_code} - {message}")]
    RunFailed {
        stage: String,
        error_code: String,
        message: String,
    },

    /// The run did not finish within the bounded wait.
    #[error("run did not finish within {0:?}")]
    Timeout(Duration),

    /// Expected and observed outcomes differ.
    #[error("assertion failed for {what}: expected {expected}, observed {observed}")]
    Assertion {
        what: String,
        expected: String,
        observed: String,
    },

    /// A rule or reply was rejected at registration.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A stage or scenario setting was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pipeline graph is malformed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HarnessError {
    /// Build an assertion failure.
    pub fn assertion(
        what: impl Into<String>,
        expected: impl ToString,
        observed: impl ToString,
    ) -> Self {
        HarnessError::Assertion {
            what: what.into(),
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }

    /// Error code of a failed run.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            HarnessError::RunFailed { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    /// Whether this is a run failure (as opposed to an assertion or setup error).
    pub fn is_run_failure(&self) -> bool {
        matches!(self, HarnessError::RunFailed { .. })
    }
}

/// Pipeline graph validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline has no source stage")]
    NoSource,

    #[error("pipeline has more than one source stage: {0:?}")]
    MultipleSources(Vec<String>),

    #[error("pipeline has no sink stage")]
    NoSink,

    #[error("unknown stage node {0}")]
    UnknownNode(usize),

    #[error("cannot connect {from} to {to}: {reason}")]
    InvalidEdge {
        from: String,
        to: String,
        reason: String,
    },

    #[error("stage {0} is not reachable from the source")]
    Unreachable(String),

    #[error("pipeline graph contains a cycle")]
    Cycle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failed_carries_code() {
        let err = HarnessError::RunFailed {
            stage: "HTTPClient_02".to_string(),
            error_code: "HTTP_14".to_string(),
            message: "status 404".to_string(),
        };
        assert!(err.is_run_failure());
        assert_eq!(err.error_code(), Some("HTTP_14"));
        assert_eq!(
            err.to_string(),
            "run failed at stage HTTPClient_02: HTTP_14 - status 404"
        );
    }

    #[test]
    fn test_assertion_display() {
        let err = HarnessError::assertion("output records", 1, 0);
        assert!(!err.is_run_failure());
        assert_eq!(err.error_code(), None);
        assert_eq!(
            err.to_string(),
            "assertion failed for output records: expected 1, observed 0"
        );
    }
}
