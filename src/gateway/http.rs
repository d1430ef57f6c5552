//! HTTP adapter for OpenAI-compatible chat-completion providers.
//!
//! The adapter owns its `reqwest::Client`; callers construct one instance
//! and hand it to the orchestrator. Streaming uses the provider's SSE
//! framing: `data:` lines carrying delta chunks, terminated by `[DONE]`.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ChatMessage, ModelGateway, TextStream};
use crate::errors::GatewayError;

/// Default per-request timeout. Long enough for a full completion; the retry
/// policy owns the overall budget.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

/// Gateway over an OpenAI-compatible HTTP endpoint.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    /// Create a gateway for the given base URL (e.g. `https://api.example.com/v1`).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let body = json!({
            "model": model,
            "messages": messages.iter().map(WireMessage::from).collect::<Vec<_>>(),
            "stream": stream,
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16()));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl ModelGateway for HttpGateway {
    async fn test_reachable(&self, model: &str) -> Result<(), GatewayError> {
        // Model listing is the cheapest authenticated probe providers offer.
        let url = format!("{}/models/{}", self.base_url, model);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16()));
        }
        Ok(())
    }

    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, GatewayError> {
        let response = self.post_completion(model, messages, false).await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| GatewayError::MalformedResponse("response carried no choices".into()))
    }

    async fn complete_streaming(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<TextStream, GatewayError> {
        let response = self.post_completion(model, messages, true).await?;

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| GatewayError::Stream(e.to_string()))
        });
        let state = SseState {
            body: Box::pin(body),
            buffer: String::new(),
        };

        let stream = futures::stream::try_unfold(state, |mut state| async move {
            loop {
                // Drain any complete SSE lines already buffered.
                while let Some(line) = state.take_line() {
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return Ok(None);
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(chunk) => {
                            let fragment = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta)
                                .and_then(|d| d.content)
                                .unwrap_or_default();
                            if !fragment.is_empty() {
                                return Ok(Some((fragment, state)));
                            }
                        }
                        Err(e) => {
                            return Err(GatewayError::MalformedResponse(format!(
                                "bad stream chunk: {e}"
                            )));
                        }
                    }
                }

                match state.body.next().await {
                    Some(Ok(text)) => state.buffer.push_str(&text),
                    Some(Err(e)) => return Err(e),
                    None => return Ok(None),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

struct SseState {
    body: std::pin::Pin<Box<dyn futures::Stream<Item = Result<String, GatewayError>> + Send>>,
    buffer: String,
}

impl SseState {
    /// Pop the next newline-terminated line from the buffer, if complete.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let line: String = self.buffer.drain(..=pos).collect();
        Some(line.trim_end().to_string())
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else if err.is_connect() {
        GatewayError::Connect(err.to_string())
    } else {
        GatewayError::Other(anyhow::anyhow!(err))
    }
}

fn map_status(status: u16) -> GatewayError {
    if status == 429 {
        GatewayError::RateLimited
    } else {
        GatewayError::Http { status }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        let role = match msg.role {
            super::Role::System => "system",
            super::Role::User => "user",
            super::Role::Assistant => "assistant",
        };
        Self {
            role,
            content: &msg.content,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<MessageBody>,
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_maps_to_rate_limited() {
        assert!(matches!(map_status(429), GatewayError::RateLimited));
        assert!(matches!(map_status(503), GatewayError::Http { status: 503 }));
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let gw = HttpGateway::new("https://api.example.com/v1/", "key").unwrap();
        assert_eq!(gw.completions_url(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn stream_chunk_parses_delta_content() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hel"}}]}"#).unwrap();
        let fragment = chunk.choices[0].delta.as_ref().unwrap().content.as_deref();
        assert_eq!(fragment, Some("hel"));
    }

    #[test]
    fn completion_response_without_choices_is_detected() {
        let parsed: CompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(parsed.choices.is_empty());
    }

    #[test]
    fn sse_state_splits_buffered_lines() {
        let mut state = SseState {
            body: Box::pin(futures::stream::empty()),
            buffer: "data: one\ndata: two\npartial".to_string(),
        };
        assert_eq!(state.take_line().as_deref(), Some("data: one"));
        assert_eq!(state.take_line().as_deref(), Some("data: two"));
        assert!(state.take_line().is_none());
        assert_eq!(state.buffer, "partial");
    }
}
