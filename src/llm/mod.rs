//! OpenAI-compatible chat client used for every model role in the core:
//! the main reply stream, the low-latency pre-reply/judge calls, and the
//! FSM classifier.
//!
//! Transient failures (timeouts, 429, 5xx) retry with exponential backoff
//! inside this module and are never surfaced to the orchestrator as
//! anything but a final error; auth and bad-request failures are tagged
//! [`CoreError::VendorRejected`] and never retried.

pub mod pre_reply;
pub mod sse;

use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{CoreError, Result};
use sse::SseDecoder;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// User content.
    User,
    /// Assistant content.
    Assistant,
}

/// One chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// System message shorthand.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message shorthand.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message shorthand.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A boxed stream of text deltas from a streamed completion.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// Chat-completions client with retry/backoff.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Build a client from config.
    ///
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'))
    }

    async fn send(&self, model: &str, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model,
            messages,
            stream,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .http
                .post(self.endpoint())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            let retryable = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        CoreError::Llm(format!("{model}: HTTP {status}: {text}"))
                    } else {
                        // Auth/quota/bad request: never retried.
                        return Err(CoreError::VendorRejected(format!(
                            "{model}: HTTP {status}: {text}"
                        )));
                    }
                }
                Err(e) => CoreError::Llm(format!("{model}: request failed: {e}")),
            };

            if attempt >= self.config.max_retries {
                return Err(retryable);
            }
            let delay = self
                .config
                .retry_base_delay_ms
                .saturating_mul(1u64 << attempt.min(6));
            warn!(model, attempt, delay_ms = delay, error = %retryable, "retrying LLM request");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    /// One-shot (non-streamed) completion.
    ///
    /// # Errors
    ///
    /// Returns an error after retries are exhausted, or immediately on a
    /// vendor rejection.
    pub async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send(model, messages, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Llm(format!("{model}: bad response body: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(model, chars = content.len(), "completion received");
        Ok(content)
    }

    /// Streamed completion yielding text deltas as they arrive.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be established; mid-stream
    /// transport errors surface as `Err` items on the stream.
    pub async fn stream(&self, model: &str, messages: &[ChatMessage]) -> Result<TokenStream> {
        let response = self.send(model, messages, true).await?;
        let mut body = response.bytes_stream();
        let model = model.to_owned();

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            let mut done = false;
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(CoreError::Llm(format!("{model}: stream transport: {e}")));
                        return;
                    }
                };
                for event in decoder.feed(&chunk) {
                    if event.is_done() {
                        done = true;
                        break;
                    }
                    if let Some(delta) = delta_text(&event.data) {
                        yield Ok(delta);
                    }
                }
                if done {
                    break;
                }
            }
            if !done {
                if let Some(event) = decoder.finish() {
                    if !event.is_done() {
                        if let Some(delta) = delta_text(&event.data) {
                            yield Ok(delta);
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Extract the delta text from one streamed chunk, ignoring malformed or
/// content-free chunks (role announcements, finish markers).
fn delta_text(data: &str) -> Option<String> {
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> LlmConfig {
        LlmConfig {
            api_url: server.uri(),
            api_key: "test-key".to_owned(),
            max_retries: 2,
            retry_base_delay_ms: 1,
            ..LlmConfig::default()
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    // ── complete ──────────────────────────────────────────────

    #[tokio::test]
    async fn complete_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("150")))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config_for(&server)).expect("client");
        let out = client
            .complete("judge", &[ChatMessage::user("hi")])
            .await
            .expect("completion");
        assert_eq!(out, "150");
    }

    #[tokio::test]
    async fn complete_retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config_for(&server)).expect("client");
        let out = client
            .complete("main", &[ChatMessage::user("hi")])
            .await
            .expect("completion after retry");
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn auth_failure_is_vendor_rejected_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(&config_for(&server)).expect("client");
        let err = client
            .complete("main", &[ChatMessage::user("hi")])
            .await
            .expect_err("401 must fail");
        assert!(matches!(err, CoreError::VendorRejected(_)));
    }

    // ── stream ────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_yields_deltas_until_done() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"。\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = LlmClient::new(&config_for(&server)).expect("client");
        let mut stream = client
            .stream("main", &[ChatMessage::user("hi")])
            .await
            .expect("stream");
        let mut collected = String::new();
        while let Some(delta) = stream.next().await {
            collected.push_str(&delta.expect("delta"));
        }
        assert_eq!(collected, "你好。");
    }

    // ── delta parsing ─────────────────────────────────────────

    #[test]
    fn delta_text_ignores_empty_and_malformed() {
        assert_eq!(
            delta_text("{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}"),
            Some("x".to_owned())
        );
        assert_eq!(delta_text("{\"choices\":[{\"delta\":{}}]}"), None);
        assert_eq!(delta_text("{\"choices\":[{\"delta\":{\"content\":\"\"}}]}"), None);
        assert_eq!(delta_text("not json"), None);
    }

    #[test]
    fn message_shorthands() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }
}
