use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};
use uuid::Uuid;

/// Contract every vendor adapter satisfies. The dispatch core only ever talks
/// to providers through this trait.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn get_provider_name(&self) -> &str;

    /// Static configuration validity (credential present etc.), not live health.
    fn is_available(&self) -> bool;

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GenerationResult>;

    /// Incremental variant of `generate`. Adapters without native streaming
    /// deliver the whole text as a single chunk.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        sink: &ChunkSink,
    ) -> ProviderResult<GenerationResult> {
        let result = self.generate(request).await?;
        sink.send(result.text.clone(), result.finish_reason.clone());
        Ok(result)
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Transient,
    Fatal,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::RateLimited => write!(f, "rate limited"),
            ProviderErrorKind::Transient => write!(f, "transient"),
            ProviderErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure reported by an adapter, tagged with how the executor should react.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, message)
    }

    /// Classifies a non-success HTTP status returned by a provider API.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("API error {}: {}", status, body);
        match status {
            429 => Self::rate_limited(message),
            408 | 500..=599 => Self::transient(message),
            _ => Self::fatal(message),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::transient(format!("HTTP request failed: {}", err))
        } else {
            Self::fatal(format!("HTTP request failed: {}", err))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl GenerationParams {
    /// Values set in `overrides` win over `self`.
    pub fn merged(&self, overrides: &GenerationParams) -> GenerationParams {
        GenerationParams {
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            top_p: overrides.top_p.or(self.top_p),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
    pub provider: Option<String>,
    pub label: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            system_prompt: None,
            params: GenerationParams::default(),
            provider: None,
            label: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.params.top_p = Some(top_p);
        self
    }

    /// Label for log lines: the caller's label, or the request id.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: String,
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn new(request: &GenerationRequest, provider: &str, model: &str, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            text,
            usage: TokenUsage::default(),
            finish_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: Option<String>) -> Self {
        self.finish_reason = finish_reason;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub provider: String,
    /// 1-based attempt on `provider`. A change in (provider, attempt) means
    /// the executor restarted generation and earlier chunks are void.
    pub attempt: u32,
    pub delta: String,
    pub finish_reason: Option<String>,
}

/// Bounded channel end handed to a provider for one streamed attempt.
///
/// Sends never wait on the caller. Once the receiver is full or gone the sink
/// closes for the rest of the attempt and later deltas are dropped; the
/// terminal `GenerationResult` still carries the full text.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    sender: mpsc::Sender<StreamChunk>,
    provider: String,
    attempt: u32,
    open: Arc<AtomicBool>,
}

impl ChunkSink {
    pub fn new(sender: mpsc::Sender<StreamChunk>, provider: impl Into<String>, attempt: u32) -> Self {
        Self {
            sender,
            provider: provider.into(),
            attempt,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Forwards a delta to the caller. Returns false when it was dropped.
    pub fn send(&self, delta: impl Into<String>, finish_reason: Option<String>) -> bool {
        if !self.is_open() {
            return false;
        }

        let chunk = StreamChunk {
            provider: self.provider.clone(),
            attempt: self.attempt,
            delta: delta.into(),
            finish_reason,
        };
        match self.sender.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Stream receiver for {} fell behind, dropping the rest of attempt {}",
                    self.provider, self.attempt
                );
                self.open.store(false, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Stream receiver dropped for {}", self.provider);
                self.open.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub defaults: GenerationParams,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            api_key: None,
            api_key_env: None,
            model: model.into(),
            base_url: None,
            defaults: GenerationParams::default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Inline key first, then the named environment variable. Empty values
    /// count as missing.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|key| !key.trim().is_empty())
            })
    }
}

/// Validates an API base URL and strips the trailing slash so endpoint paths
/// can be appended.
pub fn parse_base_url(raw: &str) -> crate::error::Result<String> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| crate::error::Error::provider_configuration(format!("Invalid base URL '{}': {}", raw, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(crate::error::Error::provider_configuration(format!(
            "Unsupported base URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}
