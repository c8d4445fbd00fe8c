//! LLM client for OpenAI-compatible chat-completions endpoints.
//!
//! This module provides:
//! - [`LlmClient`]: request construction, retry loop, response parsing
//! - [`ChatTransport`]: the single network seam, swappable in tests
//! - [`openai::HttpTransport`]: the reqwest implementation
//!
//! # Retry rules
//!
//! See [`retry::classify`]. 5xx and network failures are retried up to
//! `max_retries` times; timeouts, 4xx and malformed bodies fail at once.

mod types;

pub mod openai;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::store::Role;

pub use openai::HttpTransport;
pub use retry::{Disposition, RetryPolicy};
use types::{ApiErrorBody, ApiErrorDetail, ChatCompletionRequest, ChatCompletionResponse};

/// One role/content entry of a completion context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
}

/// Sampling options for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub content: String,
    pub usage: Usage,
}

/// A fully built HTTP request, ready for a transport to send.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// Raw HTTP outcome: any status, body as text.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Failure below HTTP: no status was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    TimedOut,
    Network(String),
}

/// Network seam for [`LlmClient`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one request, honouring `request.timeout`.
    async fn send(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportFailure>;
}

/// Chat-completions client with a fixed configuration.
pub struct LlmClient {
    config: LlmConfig,
    policy: RetryPolicy,
    transport: Arc<dyn ChatTransport>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let policy = RetryPolicy::new(config.max_retries, config.retry_backoff);
        Self {
            config,
            policy,
            transport,
        }
    }

    /// Client that talks HTTP through reqwest.
    pub fn http(config: LlmConfig) -> crate::Result<Self> {
        let transport = HttpTransport::new()?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Run one completion exchange, retrying transient failures.
    ///
    /// Exhausting the retry budget surfaces the last error observed.
    pub async fn chat(
        &self,
        context: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatReply, LlmError> {
        let request = self.build_request(context, options)?;
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            let error = match self.attempt(&request).await {
                Ok(reply) => {
                    debug!(
                        attempt,
                        prompt_tokens = reply.usage.prompt_tokens,
                        completion_tokens = reply.usage.completion_tokens,
                        "Completion succeeded"
                    );
                    return Ok(reply);
                }
                Err(error) => error,
            };

            match self.policy.next(&error, attempt) {
                Disposition::Retry => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "LLM API error (attempt {}/{}): {}; retrying in {:?}",
                        attempt, max_attempts, error, delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Disposition::Fail => {
                    error!("LLM API call failed after {} attempt(s): {}", attempt, error);
                    return Err(error);
                }
            }
        }
    }

    /// Build the wire request for `context`.
    pub fn build_request(
        &self,
        context: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<TransportRequest, LlmError> {
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: context,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        let body = serde_json::to_vec(&body)
            .map_err(|e| LlmError::Transport(format!("Failed to encode request: {e}")))?;

        let mut headers = vec![("Content-Type", "application/json".to_string())];
        if let Some(key) = &self.config.api_key {
            headers.push(("Authorization", format!("Bearer {key}")));
        }

        Ok(TransportRequest {
            url: self.config.completions_url(),
            headers,
            body,
            timeout: self.config.timeout,
        })
    }

    async fn attempt(&self, request: &TransportRequest) -> Result<ChatReply, LlmError> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|failure| match failure {
                TransportFailure::TimedOut => LlmError::Timeout(self.config.timeout),
                TransportFailure::Network(reason) => LlmError::Transport(reason),
            })?;

        if !(200..300).contains(&response.status) {
            return Err(LlmError::Upstream {
                status: response.status,
                message: extract_error_message(response.status, &response.body),
            });
        }

        parse_completion(&response.body)
    }
}

/// Pull the reply text and usage out of a 2xx body.
pub fn parse_completion(body: &str) -> Result<ChatReply, LlmError> {
    let response: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::MalformedResponse(format!("body is not a completion: {e}")))?;

    let choice = response
        .choices
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::MalformedResponse("no choices returned".to_string()))?;

    let content = choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| LlmError::MalformedResponse("no content in message".to_string()))?;

    if content.is_empty() {
        return Err(LlmError::MalformedResponse("empty content in message".to_string()));
    }

    let usage = response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(ChatReply { content, usage })
}

/// Best-effort human message for a non-2xx response.
pub fn extract_error_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        match parsed.error {
            ApiErrorDetail::Object { message: Some(message) } => return message,
            ApiErrorDetail::Text(message) => return message,
            ApiErrorDetail::Object { message: None } => {}
        }
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }

    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown error")
        .to_string()
}

/// Transport that replays a fixed script and records what it was sent.
#[cfg(test)]
pub(crate) struct ScriptedTransport {
    replies: std::sync::Mutex<
        std::collections::VecDeque<std::result::Result<TransportResponse, TransportFailure>>,
    >,
    requests: std::sync::Mutex<Vec<TransportRequest>>,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(
        replies: Vec<std::result::Result<TransportResponse, TransportFailure>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: std::sync::Mutex::new(replies.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// 200 response carrying `content` and a small usage block.
    pub fn reply(content: &str) -> std::result::Result<TransportResponse, TransportFailure> {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        });
        Self::status(200, &body.to_string())
    }

    pub fn status(
        status: u16,
        body: &str,
    ) -> std::result::Result<TransportResponse, TransportFailure> {
        Ok(TransportResponse {
            status,
            body: body.to_string(),
        })
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Context of the `n`th request, decoded from its JSON body.
    pub fn sent_messages(&self, n: usize) -> Vec<ChatMessage> {
        let body: serde_json::Value =
            serde_json::from_slice(&self.requests()[n].body).unwrap();
        serde_json::from_value(body["messages"].clone()).unwrap()
    }
}

#[cfg(test)]
#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportFailure> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportFailure::Network("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn client(transport: &Arc<ScriptedTransport>, max_retries: u32) -> LlmClient {
        let config = LlmConfig::new("http://llm.test/v1/", "test-model")
            .with_api_key("sk-test")
            .with_retries(max_retries, Duration::ZERO);
        LlmClient::new(config, transport.clone())
    }

    fn context() -> Vec<ChatMessage> {
        vec![ChatMessage::system("You are terse."), ChatMessage::user("Hi")]
    }

    #[test]
    fn test_request_wire_format() {
        let transport = ScriptedTransport::new(vec![]);
        let request = client(&transport, 0)
            .build_request(&context(), &ChatOptions::default())
            .unwrap();

        assert_eq!(request.url, "http://llm.test/v1/chat/completions");
        assert!(request
            .headers
            .contains(&("Authorization", "Bearer sk-test".to_string())));
        assert!(request
            .headers
            .contains(&("Content-Type", "application/json".to_string())));

        assert_eq!(
            String::from_utf8(request.body).unwrap(),
            r#"{"model":"test-model","messages":[{"role":"system","content":"You are terse."},{"role":"user","content":"Hi"}],"temperature":0.7}"#
        );
    }

    #[test]
    fn test_max_tokens_included_only_when_set() {
        let transport = ScriptedTransport::new(vec![]);
        let options = ChatOptions {
            temperature: 0.2,
            max_tokens: Some(64),
        };
        let request = client(&transport, 0).build_request(&context(), &options).unwrap();
        let body: Value = serde_json::from_slice(&request.body).unwrap();

        assert_eq!(body["max_tokens"], json!(64));
        assert_eq!(body["temperature"], json!(0.2));
    }

    #[test]
    fn test_no_key_means_no_authorization_header() {
        let config = LlmConfig::new("http://llm.test", "m");
        let client = LlmClient::new(config, ScriptedTransport::new(vec![]));
        let request = client.build_request(&[], &ChatOptions::default()).unwrap();
        assert!(request.headers.iter().all(|(name, _)| *name != "Authorization"));
    }

    #[tokio::test]
    async fn test_reply_and_usage_returned() {
        let body = r#"{"choices":[{"message":{"content":"Hello!"}}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::status(200, body)]);

        let reply = client(&transport, 2)
            .chat(&context(), &ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(reply.content, "Hello!");
        assert_eq!(
            reply.usage,
            Usage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7
            }
        );
        assert_eq!(transport.attempts(), 1);
    }

    #[test]
    fn test_missing_usage_defaults_to_zero() {
        let reply =
            parse_completion(r#"{"choices":[{"message":{"content":"hi"}}],"usage":{"total_tokens":3}}"#)
                .unwrap();
        assert_eq!(reply.usage.prompt_tokens, 0);
        assert_eq!(reply.usage.total_tokens, 3);

        let reply = parse_completion(r#"{"choices":[{"message":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(reply.usage, Usage::default());
    }

    #[tokio::test]
    async fn test_persistent_server_errors_exhaust_retries() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::status(503, "unavailable"),
            ScriptedTransport::status(503, "unavailable"),
            ScriptedTransport::status(503, r#"{"error":{"message":"overloaded"}}"#),
        ]);

        let err = client(&transport, 2)
            .chat(&context(), &ChatOptions::default())
            .await
            .unwrap_err();

        assert_eq!(transport.attempts(), 3);
        assert_eq!(
            err,
            LlmError::Upstream {
                status: 503,
                message: "overloaded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_then_success() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::status(500, ""),
            ScriptedTransport::reply("recovered"),
        ]);

        let reply = client(&transport, 2)
            .chat(&context(), &ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(reply.content, "recovered");
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::status(401, r#"{"error":{"message":"Invalid API key"}}"#),
            ScriptedTransport::reply("never reached"),
        ]);

        let err = client(&transport, 5)
            .chat(&context(), &ChatOptions::default())
            .await
            .unwrap_err();

        assert_eq!(transport.attempts(), 1);
        assert!(matches!(err, LlmError::Upstream { status: 401, ref message } if message == "Invalid API key"));
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportFailure::TimedOut),
            ScriptedTransport::reply("never reached"),
        ]);

        let err = client(&transport, 5)
            .chat(&context(), &ChatOptions::default())
            .await
            .unwrap_err();

        assert_eq!(transport.attempts(), 1);
        assert_eq!(err, LlmError::Timeout(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_network_failures_retried_then_surfaced() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportFailure::Network("connection refused".into())),
            Err(TransportFailure::Network("connection reset".into())),
        ]);

        let err = client(&transport, 1)
            .chat(&context(), &ChatOptions::default())
            .await
            .unwrap_err();

        assert_eq!(transport.attempts(), 2);
        assert_eq!(err, LlmError::Transport("connection reset".into()));
    }

    #[tokio::test]
    async fn test_malformed_success_is_not_retried() {
        for body in [
            "not json",
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"content":null}}]}"#,
            r#"{"choices":[{"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"message":{"content":""}}]}"#,
        ] {
            let transport = ScriptedTransport::new(vec![
                ScriptedTransport::status(200, body),
                ScriptedTransport::reply("never reached"),
            ]);

            let err = client(&transport, 3)
                .chat(&context(), &ChatOptions::default())
                .await
                .unwrap_err();

            assert_eq!(transport.attempts(), 1, "{body}");
            assert!(matches!(err, LlmError::MalformedResponse(_)), "{body}");
        }
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            extract_error_message(400, r#"{"error":{"message":"bad model","type":"invalid"}}"#),
            "bad model"
        );
        assert_eq!(extract_error_message(400, r#"{"error":"plain"}"#), "plain");
        assert_eq!(extract_error_message(502, "  upstream down \n"), "upstream down");
        assert_eq!(extract_error_message(503, ""), "Service Unavailable");
        assert_eq!(
            extract_error_message(500, r#"{"error":{"code":42}}"#),
            r#"{"error":{"code":42}}"#
        );
    }
}
