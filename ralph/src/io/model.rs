//! Model client seam and the OpenAI-compatible HTTP implementation.
//!
//! The orchestrator only sees [`ModelClient`]; tests substitute a scripted
//! client. Transport failures come back as [`ModelError`] so the caller can
//! decide between retrying and recording a network observation.

use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::config::{ModelConfig, RetryConfig};
use crate::core::text::truncate_ellipsis;
use crate::core::types::{Role, Turn};
use crate::error::ModelError;

/// Wire message for the chat completions API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelRequest {
    /// Request over the whole conversation, in order. Engine-side metadata is not sent.
    pub fn from_history(history: &[Turn], temperature: f32, max_tokens: u32) -> Self {
        Self {
            messages: history.iter().map(ChatMessage::from).collect(),
            temperature,
            max_tokens,
        }
    }

    /// Single system + user exchange, used by the historian and critique phases.
    pub fn single(system: &str, user: &str, temperature: f32, max_tokens: u32) -> Self {
        Self {
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: system.to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: user.to_string(),
                },
            ],
            temperature,
            max_tokens,
        }
    }

    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Produces the raw text of one model reply.
pub trait ModelClient {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

/// Client for any endpoint speaking `POST /v1/chat/completions`.
pub struct OpenAiCompatClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    stream: bool,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let timeout = config.timeout();
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty());
        Ok(Self {
            http,
            endpoint: chat_endpoint(&config.base_url),
            model: config.model.clone(),
            api_key,
            stream: config.stream,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout(self.timeout)
        } else {
            ModelError::Network(err.to_string())
        }
    }
}

impl ModelClient for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %self.model, stream = self.stream, chars = request.total_chars()))]
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": self.stream,
        });

        let mut builder = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        if self.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        debug!(endpoint = %self.endpoint, "sending completion request");
        let response = builder.send().map_err(|err| self.transport_error(err))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            warn!(status = status.as_u16(), "model endpoint returned error");
            return Err(ModelError::Status {
                code: status.as_u16(),
                body: truncate_ellipsis(text.trim(), 500),
            });
        }

        if self.stream {
            return read_sse(BufReader::new(response));
        }
        let text = response.text().map_err(|err| self.transport_error(err))?;
        extract_content(&text)
    }
}

/// Normalize a base URL to the chat completions endpoint.
pub fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Take `choices[0].message.content` from a non-streaming reply.
fn extract_content(body: &str) -> Result<String, ModelError> {
    let parsed: ApiResponse = serde_json::from_str(body)
        .map_err(|err| ModelError::Malformed(format!("invalid json: {err}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Malformed("no choices in response".to_string()))?;
    Ok(choice.message.content.unwrap_or_default())
}

/// Concatenate `choices[0].delta.content` across `data:` events until `[DONE]`.
fn read_sse<R: BufRead>(reader: R) -> Result<String, ModelError> {
    let mut content = String::new();
    for line in reader.lines() {
        let line = line.map_err(|err| ModelError::Network(format!("stream read: {err}")))?;
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            break;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            debug!(data, "skipping unparseable stream event");
            continue;
        };
        if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
            content.push_str(delta);
        }
    }
    Ok(content)
}

/// Call `client`, retrying retryable failures with exponential backoff.
pub fn complete_with_retry<C: ModelClient + ?Sized>(
    client: &C,
    request: &ModelRequest,
    retry: &RetryConfig,
) -> Result<String, ModelError> {
    let mut attempt = 1;
    loop {
        match client.complete(request) {
            Ok(text) => return Ok(text),
            Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "model call failed, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(
            chat_endpoint("http://localhost:1234"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://host/v1/chat/completions"),
            "https://host/v1/chat/completions"
        );
    }

    #[test]
    fn extracts_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}},{"message":{"content":"no"}}]}"#;
        assert_eq!(extract_content(body).expect("content"), "hi");
        let err = extract_content(r#"{"choices":[]}"#).expect_err("empty");
        assert!(matches!(err, ModelError::Malformed(_)));
    }

    /// Verifies SSE deltas are joined and reading stops at `[DONE]`.
    #[test]
    fn sse_stream_is_concatenated() {
        let stream = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                      : keep-alive\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                      data: [DONE]\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n";
        assert_eq!(read_sse(stream.as_bytes()).expect("read"), "Hello");
    }

    #[test]
    fn retries_only_retryable_errors() {
        let retry = RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 1,
            ..RetryConfig::default()
        };
        let request = ModelRequest::single("s", "u", 0.1, 10);

        let model = ScriptedModel::new();
        model.push_error(ModelError::Network("reset".to_string()));
        model.push_error(ModelError::Status {
            code: 503,
            body: String::new(),
        });
        model.push_reply("ok");
        assert_eq!(complete_with_retry(&model, &request, &retry).expect("reply"), "ok");
        assert_eq!(model.requests().len(), 3);

        let model = ScriptedModel::new();
        model.push_error(ModelError::Status {
            code: 401,
            body: "denied".to_string(),
        });
        model.push_reply("unused");
        let err = complete_with_retry(&model, &request, &retry).expect_err("fatal");
        assert!(matches!(err, ModelError::Status { code: 401, .. }));
        assert_eq!(model.requests().len(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            ..RetryConfig::default()
        };
        let model = ScriptedModel::new();
        for _ in 0..3 {
            model.push_error(ModelError::Network("down".to_string()));
        }
        let err = complete_with_retry(&model, &ModelRequest::single("s", "u", 0.1, 10), &retry)
            .expect_err("down");
        assert!(matches!(err, ModelError::Network(_)));
        assert_eq!(model.requests().len(), 2);
    }
}
