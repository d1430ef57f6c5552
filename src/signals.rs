//! Structured writer-reply parsing for the clarification phase.
//!
//! The writer answers each clarification turn with a JSON payload carrying a
//! `ready` boolean and a user-visible `message`. Models habitually wrap JSON
//! in a markdown code fence, so the fence is stripped before parsing. A
//! payload missing the boolean or the non-empty message is an
//! `InvalidWriterReply` — never silently treated as "not ready".

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::WorkflowError;

// Tolerates ```json ... ``` and bare ``` fences, with surrounding whitespace.
static CODE_FENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```(?:[a-zA-Z0-9_-]*)?\s*\n?(.*?)\n?\s*```\s*$").unwrap()
});

/// The writer's structured clarification reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterReply {
    /// Whether the writer considers the requirements clear enough to proceed.
    pub ready: bool,
    /// User-visible text: the next question, or a readiness summary.
    pub message: String,
    /// Optional working notes the writer keeps for itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Strip a surrounding markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    match CODE_FENCE_REGEX.captures(text) {
        Some(caps) => caps.get(1).map_or(text, |m| m.as_str()),
        None => text.trim(),
    }
}

/// Parse the fully-accumulated writer reply.
///
/// Must only be called on the complete payload — never on partial stream
/// fragments. Phase-advancing decisions gate strictly on this parse.
pub fn parse_writer_reply(raw: &str) -> Result<WriterReply, WorkflowError> {
    let payload = strip_code_fence(raw);

    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| WorkflowError::InvalidWriterReply(format!("not valid JSON: {e}")))?;

    let Some(obj) = value.as_object() else {
        return Err(WorkflowError::InvalidWriterReply(
            "payload is not a JSON object".into(),
        ));
    };

    let ready = obj
        .get("ready")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| {
            WorkflowError::InvalidWriterReply("missing boolean \"ready\" field".into())
        })?;

    let message = obj
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            WorkflowError::InvalidWriterReply("missing or empty \"message\" field".into())
        })?
        .to_string();

    let notes = obj
        .get("notes")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    Ok(WriterReply {
        ready,
        message,
        notes,
    })
}
