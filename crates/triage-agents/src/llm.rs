//! Completion client: chat completions that must come back as structured JSON.
//!
//! Every call goes through a [`CorrectionLoop`]: strict parse and validate,
//! then salvage and re-validate, then (with retries left) a corrective turn
//! asking for JSON only. Network-level failures are surfaced immediately and
//! never retried.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{HealthProbe, LlmConfig};
use crate::errors::{snippet, CompletionError, SNIPPET_CHARS};
use crate::prompts::CORRECTIVE_INSTRUCTION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Transport to an OpenAI-style chat completion endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send the conversation and return the assistant's text.
    async fn chat(&self, request: &ChatRequest) -> Result<String, CompletionError>;
}

/// `POST {base_url}/chat/completions` over reqwest.
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_secs: u64,
}

impl HttpChatBackend {
    pub fn new(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn chat(&self, request: &ChatRequest) -> Result<String, CompletionError> {
        let endpoint = self.endpoint();
        let body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });

        let mut builder = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            let err = CompletionError::from_reqwest(&endpoint, self.timeout_secs, e);
            error!(endpoint = %endpoint, error = %err, "LLM request failed");
            err
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(endpoint = %endpoint, status = status.as_u16(), "LLM returned error status");
            return Err(CompletionError::Http {
                endpoint,
                status: status.as_u16(),
                body: snippet(&body, SNIPPET_CHARS),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::from_reqwest(&endpoint, self.timeout_secs, e))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CompletionError::Transport {
                endpoint,
                message: "response has no choices[0].message.content".to_string(),
            })
    }
}

/// Bounded corrective-retry state: attempt count plus conversation history.
///
/// The conversation starts as `[system, user]`; each failed attempt with
/// retries left appends the raw assistant reply and a corrective user turn.
#[derive(Debug, Clone)]
pub struct CorrectionLoop {
    messages: Vec<ChatMessage>,
    attempts: u32,
    max_retries: u32,
}

impl CorrectionLoop {
    pub fn new(system_prompt: &str, user_prompt: &str, max_retries: u32) -> Self {
        Self {
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_prompt),
            ],
            attempts: 0,
            max_retries,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Upper bound on the conversation length sent to the model.
    pub fn max_conversation_len(&self) -> usize {
        2 + 2 * self.max_retries as usize
    }

    /// Start the next attempt. Returns `false` once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts >= self.max_attempts() {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts()
    }

    /// Record a reply that failed validation. Appends the corrective turn
    /// only when another attempt will follow.
    pub fn record_failure(&mut self, raw: &str) {
        if self.can_retry() {
            self.messages.push(ChatMessage::assistant(raw));
            self.messages.push(ChatMessage::user(CORRECTIVE_INSTRUCTION));
        }
    }
}

/// One structured completion request.
#[derive(Debug, Clone)]
pub struct StructuredRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_retries: u32,
}

/// Chat completions validated into typed values.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn ChatBackend>,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Run a structured completion through the correction loop.
    ///
    /// `validate` turns parsed JSON into `T` or explains why it cannot.
    pub async fn complete_structured<T, F>(
        &self,
        request: StructuredRequest<'_>,
        validate: F,
    ) -> Result<T, CompletionError>
    where
        F: Fn(Value) -> Result<T, String>,
    {
        let mut lp = CorrectionLoop::new(
            request.system_prompt,
            &request.user_prompt,
            request.max_retries,
        );
        let mut last_raw = String::new();
        let mut last_reason = String::from("no attempt made");

        while lp.begin_attempt() {
            let attempt = lp.attempts();
            debug!(
                attempt,
                max_attempts = lp.max_attempts(),
                messages = lp.messages().len(),
                "Requesting structured completion"
            );

            let raw = self
                .backend
                .chat(&ChatRequest {
                    messages: lp.messages().to_vec(),
                    temperature: request.temperature,
                    max_tokens: request.max_tokens,
                })
                .await?;

            match parse_and_validate(&raw, &validate) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Structured completion recovered after correction");
                    }
                    return Ok(value);
                }
                Err(reason) => {
                    warn!(
                        attempt,
                        reason = %reason,
                        raw = %snippet(&raw, SNIPPET_CHARS),
                        "Completion failed validation"
                    );
                    lp.record_failure(&raw);
                    last_raw = raw;
                    last_reason = reason;
                }
            }
        }

        Err(CompletionError::InvalidOutput {
            attempts: lp.attempts(),
            reason: last_reason,
            last_raw,
        })
    }
}

/// Strict parse first, then salvage and parse again.
fn parse_and_validate<T, F>(raw: &str, validate: &F) -> Result<T, String>
where
    F: Fn(Value) -> Result<T, String>,
{
    let strict = serde_json::from_str::<Value>(raw.trim())
        .map_err(|e| format!("strict parse: {e}"))
        .and_then(validate);
    let strict_err = match strict {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let repaired = triage::salvage(raw);
    if repaired.trim().is_empty() {
        return Err(format!("{strict_err}; salvage produced nothing"));
    }
    serde_json::from_str::<Value>(&repaired)
        .map_err(|e| format!("{strict_err}; salvaged parse: {e}"))
        .and_then(validate)
}

/// Outcome of probing the LLM endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmHealth {
    pub alive: bool,
    /// The probe that succeeded, if any.
    pub probe: Option<HealthProbe>,
    pub detail: String,
}

/// Try each configured probe in order until one reports the endpoint alive.
pub async fn probe_llm_health(config: &LlmConfig) -> LlmHealth {
    let client = match reqwest::Client::builder()
        .timeout(config.health_timeout())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return LlmHealth {
                alive: false,
                probe: None,
                detail: format!("failed to build HTTP client: {e}"),
            }
        }
    };

    let base = config.base_url.trim_end_matches('/');
    let mut failures = Vec::new();

    for probe in &config.health_probes {
        let result = match probe {
            HealthProbe::Models => get_ok(&client, &format!("{base}/models"), config).await,
            HealthProbe::OllamaTags => {
                get_ok(&client, &format!("{}/api/tags", server_root(base)), config).await
            }
            HealthProbe::Completion => completion_alive(&client, base, config).await,
        };
        match result {
            Ok(()) => {
                debug!(?probe, endpoint = %base, "LLM endpoint alive");
                return LlmHealth {
                    alive: true,
                    probe: Some(*probe),
                    detail: format!("{probe:?} probe succeeded"),
                };
            }
            Err(reason) => failures.push(format!("{probe:?}: {reason}")),
        }
    }

    warn!(endpoint = %base, failures = ?failures, "LLM endpoint unreachable");
    LlmHealth {
        alive: false,
        probe: None,
        detail: failures.join("; "),
    }
}

/// `http://host:11434/v1` → `http://host:11434`
fn server_root(base: &str) -> &str {
    base.strip_suffix("/v1").unwrap_or(base)
}

async fn get_ok(client: &reqwest::Client, url: &str, config: &LlmConfig) -> Result<(), String> {
    let mut req = client.get(url);
    if let Some(key) = &config.api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await.map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", resp.status().as_u16()))
    }
}

/// Any non-5xx answer means a server is listening.
async fn completion_alive(
    client: &reqwest::Client,
    base: &str,
    config: &LlmConfig,
) -> Result<(), String> {
    let mut req = client.post(format!("{base}/chat/completions")).json(&json!({
        "model": config.model,
        "messages": [{"role": "user", "content": "ping"}],
        "max_tokens": 1,
        "stream": false,
    }));
    if let Some(key) = &config.api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await.map_err(|e| e.to_string())?;
    if resp.status().is_server_error() {
        Err(format!("HTTP {}", resp.status().as_u16()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn request(max_retries: u32) -> StructuredRequest<'static> {
        StructuredRequest {
            system_prompt: "system",
            user_prompt: "user".into(),
            temperature: 0.2,
            max_tokens: 256,
            max_retries,
        }
    }

    fn title(value: Value) -> Result<String, String> {
        value["title"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "missing title".to_string())
    }

    #[test]
    fn correction_loop_is_bounded() {
        let mut lp = CorrectionLoop::new("s", "u", 2);
        assert_eq!(lp.max_attempts(), 3);
        assert_eq!(lp.max_conversation_len(), 6);

        while lp.begin_attempt() {
            lp.record_failure("garbage");
        }
        assert_eq!(lp.attempts(), 3);
        assert_eq!(lp.messages().len(), lp.max_conversation_len());
        assert_eq!(lp.messages()[3].content, CORRECTIVE_INSTRUCTION);
        assert!(!lp.begin_attempt());
    }

    #[tokio::test]
    async fn salvaged_reply_succeeds_without_retry() {
        let mut backend = MockChatBackend::new();
        backend
            .expect_chat()
            .times(1)
            .returning(|_| Ok("```json\n{title: 'Crash',}\n```".to_string()));

        let client = CompletionClient::new(Arc::new(backend));
        let value = client.complete_structured(request(2), title).await.unwrap();
        assert_eq!(value, "Crash");
    }

    #[tokio::test]
    async fn corrective_turn_carries_previous_reply() {
        let mut seq = Sequence::new();
        let mut backend = MockChatBackend::new();
        backend
            .expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req| req.messages.len() == 2)
            .returning(|_| Ok("I think the title is Crash".to_string()));
        backend
            .expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|req| {
                req.messages.len() == 4
                    && req.messages[2].role == ChatRole::Assistant
                    && req.messages[2].content == "I think the title is Crash"
                    && req.messages[3].content == CORRECTIVE_INSTRUCTION
            })
            .returning(|_| Ok(r#"{"title": "Crash"}"#.to_string()));

        let client = CompletionClient::new(Arc::new(backend));
        assert_eq!(
            client.complete_structured(request(1), title).await.unwrap(),
            "Crash"
        );
    }

    #[tokio::test]
    async fn exhausted_retries_keep_last_raw() {
        let mut backend = MockChatBackend::new();
        backend
            .expect_chat()
            .times(2)
            .returning(|_| Ok(r#"{"name": "no title here"}"#.to_string()));

        let client = CompletionClient::new(Arc::new(backend));
        let err = client
            .complete_structured(request(1), title)
            .await
            .unwrap_err();
        match err {
            CompletionError::InvalidOutput {
                attempts, last_raw, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_raw.contains("no title here"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let mut backend = MockChatBackend::new();
        backend.expect_chat().times(1).returning(|_| {
            Err(CompletionError::Transport {
                endpoint: "http://llm/v1/chat/completions".into(),
                message: "connection refused".into(),
            })
        });

        let client = CompletionClient::new(Arc::new(backend));
        let err = client
            .complete_structured(request(3), title)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Transport { .. }));
    }

    #[test]
    fn server_root_strips_api_prefix() {
        assert_eq!(server_root("http://host:11434/v1"), "http://host:11434");
        assert_eq!(server_root("http://host:8080"), "http://host:8080");
    }
}
