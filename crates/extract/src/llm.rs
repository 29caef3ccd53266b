use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tallyslip_core::{LlmConfig, Secret};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No LLM API key configured")]
    MissingApiKey,
    #[error("LLM {0} is not configured")]
    MissingSetting(&'static str),
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("LLM service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("LLM response had no message content")]
    EmptyResponse,
    #[error("LLM response was not understood: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::Status { status: 429, .. })
    }

    /// Worth resubmitting the same request: network trouble, timeouts, and
    /// server-side failures.
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(e) => !e.is_builder(),
            LlmError::Status { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// A chat-completion language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

#[async_trait]
impl<T: ChatModel + ?Sized> ChatModel for std::sync::Arc<T> {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        (**self).complete(messages).await
    }
}

// ── OpenAI-compatible HTTP client ─────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_format: Option<&'a str>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI protocol
/// (Groq, GitHub Models, NVIDIA NIM, OpenAI, local servers).
pub struct OpenAiCompatibleChat {
    client: Client,
    base_url: String,
    model: String,
    api_keys: Vec<Secret>,
    temperature: f32,
    max_retries: u32,
    retry_backoff: Duration,
    max_backoff: Duration,
    max_tokens: Option<u32>,
    json_mode: bool,
    reasoning_format: Option<String>,
}

impl OpenAiCompatibleChat {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_keys: Vec<Secret>) -> Self {
        let defaults = LlmConfig::default();
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_keys,
            temperature: defaults.temperature,
            max_retries: defaults.max_retries,
            retry_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            max_tokens: None,
            json_mode: false,
            reasoning_format: None,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config.base_url().ok_or(LlmError::MissingSetting("base_url"))?;
        let model = config.model().ok_or(LlmError::MissingSetting("model"))?;

        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let mut chat = Self::new(base_url, model, config.api_keys.clone())
            .with_client(builder.build()?)
            .with_temperature(config.temperature)
            .with_max_retries(config.max_retries)
            .with_json_mode(config.json_mode);
        chat.max_tokens = config.max_tokens;
        chat.reasoning_format = config.reasoning_format.clone();
        Ok(chat)
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Ceiling for a single retry delay.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Delay before retry number `attempt + 1`: doubles each time, capped.
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt)).min(self.max_backoff)
    }

    async fn send_once(&self, key: &str, request: &ChatRequest<'_>) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }

        let body = response.text().await?;
        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    /// Resubmit transient failures up to `max_retries` times with exponential
    /// backoff. Rate limiting only counts as transient when there is no other
    /// key left to fall back to.
    async fn send_with_retries(
        &self,
        key: &str,
        request: &ChatRequest<'_>,
        retry_rate_limits: bool,
    ) -> Result<String, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(key, request).await {
                Err(err)
                    if attempt < self.max_retries
                        && (err.is_transient() || (retry_rate_limits && err.is_rate_limited())) =>
                {
                    let delay = self.backoff_for(attempt);
                    attempt += 1;
                    warn!(attempt, max_retries = self.max_retries, ?delay, error = %err, "Retrying LLM request");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let keys: Vec<&Secret> = self.api_keys.iter().filter(|k| !k.is_blank()).collect();
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.json_mode.then_some(ResponseFormat { kind: "json_object" }),
            reasoning_format: self.reasoning_format.as_deref(),
        };
        debug!(model = %self.model, messages = messages.len(), keys = keys.len(), "Sending chat completion");

        for (index, key) in keys.iter().enumerate() {
            let is_last = index + 1 == keys.len();
            match self.send_with_retries(key.expose(), &request, is_last).await {
                Err(err) if !is_last && err.is_rate_limited() => {
                    warn!(key_index = index, "LLM key rate limited, trying fallback key");
                }
                result => return result,
            }
        }
        Err(LlmError::MissingApiKey)
    }
}

// ── Mock model (always available, used for tests) ────────────────────────────

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Unavailable,
}

/// Answers every request with a canned reply and records what it was sent.
#[derive(Debug)]
pub struct MockChatModel {
    reply: MockReply,
    calls: AtomicUsize,
    last_messages: Mutex<Option<Vec<ChatMessage>>>,
}

impl MockChatModel {
    pub fn new(response: impl Into<String>) -> Self {
        Self::with_reply(MockReply::Text(response.into()))
    }

    /// A model whose service is always down (HTTP 503).
    pub fn unavailable() -> Self {
        Self::with_reply(MockReply::Unavailable)
    }

    fn with_reply(reply: MockReply) -> Self {
        Self { reply, calls: AtomicUsize::new(0), last_messages: Mutex::new(None) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Option<Vec<ChatMessage>> {
        self.last_messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap_or_else(PoisonError::into_inner) = Some(messages.to_vec());
        match &self.reply {
            MockReply::Text(text) => Ok(text.clone()),
            MockReply::Unavailable => Err(LlmError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                body: "mock model unavailable".into(),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
