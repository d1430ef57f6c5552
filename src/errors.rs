//! Typed error hierarchy for the specwright orchestrator.
//!
//! Two top-level enums cover the two failure domains:
//! - `GatewayError` — model provider call failures, with transient classification
//! - `WorkflowError` — orchestrator, state machine, and persistence failures

use thiserror::Error;

use crate::machine::WorkflowPhase;

/// Errors from a single model gateway call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Rate limited by provider (HTTP 429)")]
    RateLimited,

    #[error("Provider returned HTTP {status}")]
    Http { status: u16 },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether this error is worth retrying.
    ///
    /// Rate limiting and network-level failures (timeout, reset, refused,
    /// 502/503/504) are transient; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RateLimited => true,
            GatewayError::Timeout => true,
            GatewayError::Connect(_) => true,
            GatewayError::Http { status } => matches!(status, 502 | 503 | 504),
            GatewayError::Stream(_) => true,
            GatewayError::MalformedResponse(_) => false,
            GatewayError::Other(_) => false,
        }
    }

    /// Whether this error indicates provider-side throttling.
    ///
    /// Rate-limit faults back off with a larger base delay than other
    /// transient faults.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GatewayError::RateLimited)
    }
}

/// Errors from the workflow engine and its collaborators.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Model {model} is unreachable")]
    Unreachable { model: String },

    #[error("Invalid writer reply: {0}")]
    InvalidWriterReply(String),

    #[error("Review round {round} failed: {}", failed.join(", "))]
    RoundFailure { round: u32, failed: Vec<String> },

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },

    #[error("Storage failure: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Workflow aborted")]
    Aborted,

    /// A gateway fault that survived the retry policy's full budget.
    #[error("Provider call failed after retries: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn storage(message: impl Into<String>, source: std::io::Error) -> Self {
        WorkflowError::Storage {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn storage_msg(message: impl Into<String>) -> Self {
        WorkflowError::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// The model this failure names, if any.
    pub fn model_id(&self) -> Option<&str> {
        match self {
            WorkflowError::Unreachable { model } => Some(model),
            WorkflowError::RoundFailure { failed, .. } => failed.first().map(String::as_str),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_transient_and_rate_limited() {
        let err = GatewayError::RateLimited;
        assert!(err.is_transient());
        assert!(err.is_rate_limited());
    }

    #[test]
    fn gateway_5xx_is_transient_4xx_is_not() {
        assert!(GatewayError::Http { status: 502 }.is_transient());
        assert!(GatewayError::Http { status: 503 }.is_transient());
        assert!(GatewayError::Http { status: 504 }.is_transient());
        assert!(!GatewayError::Http { status: 400 }.is_transient());
        assert!(!GatewayError::Http { status: 401 }.is_transient());
    }

    #[test]
    fn network_faults_are_transient() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::Connect("connection refused".into()).is_transient());
        assert!(GatewayError::Stream("reset by peer".into()).is_transient());
    }

    #[test]
    fn malformed_response_is_not_transient() {
        assert!(!GatewayError::MalformedResponse("truncated json".into()).is_transient());
        assert!(!GatewayError::Timeout.is_rate_limited());
    }

    #[test]
    fn round_failure_lists_models() {
        let err = WorkflowError::RoundFailure {
            round: 2,
            failed: vec!["model-b".into(), "model-c".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("round 2"));
        assert!(msg.contains("model-b"));
        assert!(msg.contains("model-c"));
        assert_eq!(err.model_id(), Some("model-b"));
    }

    #[test]
    fn invalid_transition_names_both_phases() {
        let err = WorkflowError::InvalidTransition {
            from: WorkflowPhase::Idle,
            to: WorkflowPhase::Reviewing,
        };
        assert!(err.to_string().contains("idle"));
        assert!(err.to_string().contains("reviewing"));
    }

    #[test]
    fn workflow_error_converts_from_gateway_error() {
        let err: WorkflowError = GatewayError::RateLimited.into();
        assert!(matches!(err, WorkflowError::Gateway(_)));
    }
}
