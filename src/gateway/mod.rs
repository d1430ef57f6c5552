//! The model gateway contract.
//!
//! The orchestrator talks to providers exclusively through [`ModelGateway`]:
//! a reachability probe, a single completion, and a streaming completion
//! that yields text fragments. Transport details (HTTP framing, auth) live
//! behind the trait; [`http::HttpGateway`] is the production adapter and the
//! integration tests script their own.

pub mod http;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Message role in the machine-facing conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a gateway call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A finite, non-restartable sequence of text fragments. The stream may fail
/// mid-flight with a transport error; fragments received before the failure
/// must be discarded by the caller, never committed.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// The provider boundary.
///
/// Implementations are plain injected instances owned by the orchestrator's
/// constructor; there is no process-wide client cache.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Cheap reachability probe for preflight.
    async fn test_reachable(&self, model: &str) -> Result<(), GatewayError>;

    /// One fully-buffered completion.
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, GatewayError>;

    /// A streamed completion. Fragments arrive lazily; the full text is the
    /// concatenation of all fragments.
    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<TextStream, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
