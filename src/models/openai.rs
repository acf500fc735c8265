use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE}};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    parse_base_url, ChunkSink, GenerationParams, GenerationRequest, GenerationResult, ModelProvider,
    ProviderConfig, ProviderError, ProviderResult, TokenUsage,
};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for OpenAI-compatible chat completion APIs.
pub struct OpenAIProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    defaults: GenerationParams,
}

impl OpenAIProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            Error::provider_configuration(format!("Provider '{}' has no API key", config.name))
        })?;
        let base_url = parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::provider_configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key,
            base_url,
            model: config.model.clone(),
            defaults: config.defaults.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn create_headers(&self) -> ProviderResult<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ProviderError::fatal(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn build_body(&self, request: &GenerationRequest, stream: bool) -> OpenAIRequest {
        let params = self.defaults.merged(&request.params);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        OpenAIRequest {
            model: self.model.clone(),
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stream: stream.then_some(true),
            stream_options: stream.then_some(OpenAIStreamOptions { include_usage: true }),
        }
    }

    async fn post(&self, body: &OpenAIRequest) -> ProviderResult<reqwest::Response> {
        let headers = self.create_headers()?;

        debug!("Sending request to {}: model={}", self.name, body.model);
        let start_time = Instant::now();

        let response = self.client
            .post(self.endpoint())
            .headers(headers)
            .json(body)
            .send()
            .await?;

        debug!("{} responded in {:?}", self.name, start_time.elapsed());

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("{} API error: {} - {}", self.name, status, error_text);
            return Err(ProviderError::from_status(status.as_u16(), &error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    fn get_provider_name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GenerationResult> {
        let body = self.build_body(request, false);
        let response: OpenAIResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::fatal(format!("Failed to parse response: {}", e)))?;

        response.into_result(request, &self.name)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        sink: &ChunkSink,
    ) -> ProviderResult<GenerationResult> {
        let body = self.build_body(request, true);
        let response = self.post(&body).await?;

        let mut bytes = response.bytes_stream();
        let mut state = StreamState::new(&self.model);

        while let Some(chunk) = bytes.next().await {
            if state.feed(&chunk?, sink)? {
                break;
            }
        }

        state.into_result(request, &self.name)
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Accumulates an SSE body into deltas and the final result.
struct StreamState {
    buffer: Vec<u8>,
    text: String,
    usage: TokenUsage,
    finish_reason: Option<String>,
    model: String,
    done: bool,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            buffer: Vec::new(),
            text: String::new(),
            usage: TokenUsage::default(),
            finish_reason: None,
            model: model.to_string(),
            done: false,
        }
    }

    /// Consumes raw body bytes, forwarding deltas to `sink`. Returns true once
    /// `[DONE]` has been seen.
    fn feed(&mut self, bytes: &[u8], sink: &ChunkSink) -> ProviderResult<bool> {
        self.buffer.extend_from_slice(bytes);

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8(line)
                .map_err(|e| ProviderError::transient(format!("Invalid UTF-8 in stream: {}", e)))?;

            match parse_stream_line(&line) {
                Some(StreamLine::Done) => {
                    self.done = true;
                    return Ok(true);
                }
                Some(StreamLine::Data(event)) => self.apply(event, sink),
                None => continue,
            }
        }

        Ok(false)
    }

    fn apply(&mut self, event: OpenAIStreamResponse, sink: &ChunkSink) {
        if let Some(model) = event.model {
            self.model = model;
        }
        if let Some(u) = event.usage {
            self.usage = TokenUsage::new(u.prompt_tokens, u.completion_tokens);
        }
        if let Some(choice) = event.choices.into_iter().next() {
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason.clone();
            }
            let delta = choice.delta.content.unwrap_or_default();
            if !delta.is_empty() || choice.finish_reason.is_some() {
                self.text.push_str(&delta);
                sink.send(delta, choice.finish_reason);
            }
        }
    }

    /// A body that closed without `[DONE]` or a finish reason was cut short.
    fn into_result(self, request: &GenerationRequest, provider: &str) -> ProviderResult<GenerationResult> {
        if !self.done && self.finish_reason.is_none() {
            warn!("{} stream ended before completion after {} bytes of text", provider, self.text.len());
            return Err(ProviderError::transient("stream ended before completion"));
        }

        Ok(GenerationResult::new(request, provider, &self.model, self.text)
            .with_usage(self.usage)
            .with_finish_reason(self.finish_reason))
    }
}

enum StreamLine {
    Data(OpenAIStreamResponse),
    Done,
}

/// Parses one server-sent-events line; comments, blanks and unparseable
/// payloads yield `None`.
fn parse_stream_line(line: &str) -> Option<StreamLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamLine::Done);
    }

    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(event) => Some(StreamLine::Data(event)),
        Err(e) => {
            debug!("Failed to parse stream response: {} (data: {})", e, data);
            None
        }
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAIStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAIStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

impl OpenAIResponse {
    fn into_result(self, request: &GenerationRequest, provider: &str) -> ProviderResult<GenerationResult> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::fatal("No choices in response"))?;

        let usage = self
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(GenerationResult::new(
            request,
            provider,
            &self.model,
            choice.message.content.unwrap_or_default(),
        )
        .with_usage(usage)
        .with_finish_reason(choice.finish_reason))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::ProviderKind;

    fn config() -> ProviderConfig {
        ProviderConfig::new("openai", ProviderKind::OpenAI, "gpt-4o-mini").with_api_key("test-key")
    }

    #[test]
    fn test_provider_creation() {
        let provider = OpenAIProvider::from_config(&config()).unwrap();
        assert_eq!(provider.get_provider_name(), "openai");
        assert!(provider.is_available());
        assert!(provider.supports_streaming());
        assert_eq!(provider.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let config = ProviderConfig::new("openai", ProviderKind::OpenAI, "gpt-4o-mini");
        let err = OpenAIProvider::from_config(&config).err().unwrap();
        assert!(matches!(err, Error::ProviderConfiguration(_)));
    }

    #[test]
    fn test_custom_base_url() {
        let config = config().with_base_url("http://localhost:11434/v1/");
        let provider = OpenAIProvider::from_config(&config).unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_body_merges_defaults_and_system_prompt() {
        let mut config = config();
        config.defaults.temperature = Some(0.7);
        config.defaults.max_tokens = Some(256);
        let provider = OpenAIProvider::from_config(&config).unwrap();

        let request = GenerationRequest::new("Hello")
            .with_system_prompt("Be brief")
            .with_temperature(0.1);
        let body = provider.build_body(&request, false);

        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[1].content, "Hello");
        assert_eq!(body.temperature, Some(0.1));
        assert_eq!(body.max_tokens, Some(256));
        assert!(body.stream.is_none());

        let json = serde_json::to_value(provider.build_body(&request, true)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_parse_stream_lines() {
        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line(": keep-alive").is_none());
        assert!(matches!(parse_stream_line("data: [DONE]"), Some(StreamLine::Done)));

        let line = r#"data: {"model":"gpt-4o-mini","choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        match parse_stream_line(line) {
            Some(StreamLine::Data(event)) => {
                assert_eq!(event.choices[0].delta.content.as_deref(), Some("Hi"));
                assert_eq!(event.model.as_deref(), Some("gpt-4o-mini"));
            }
            _ => panic!("expected data line"),
        }

        let usage_only = r#"data: {"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2,"total_tokens":6}}"#;
        match parse_stream_line(usage_only) {
            Some(StreamLine::Data(event)) => assert_eq!(event.usage.unwrap().completion_tokens, 2),
            _ => panic!("expected usage line"),
        }
    }

    fn sink() -> (ChunkSink, tokio::sync::mpsc::Receiver<crate::models::provider::StreamChunk>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        (ChunkSink::new(tx, "openai", 1), rx)
    }

    const DELTA_HI: &str = "data: {\"model\":\"gpt-4o-mini-2024\",\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n";
    const DELTA_THERE: &str = "data: {\"choices\":[{\"delta\":{\"content\":\" there\"},\"finish_reason\":null}]}\n\n";
    const FINISH: &str = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n";
    const USAGE: &str = "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n";

    #[tokio::test]
    async fn test_stream_state_assembles_result() {
        let (sink, mut rx) = sink();
        let mut state = StreamState::new("gpt-4o-mini");
        let request = GenerationRequest::new("Hello");

        // Split mid-line to exercise buffering across reads.
        let (head, tail) = DELTA_HI.split_at(20);
        assert!(!state.feed(head.as_bytes(), &sink).unwrap());
        assert!(!state.feed(tail.as_bytes(), &sink).unwrap());
        assert!(!state.feed(DELTA_THERE.as_bytes(), &sink).unwrap());
        assert!(!state.feed(FINISH.as_bytes(), &sink).unwrap());
        assert!(!state.feed(USAGE.as_bytes(), &sink).unwrap());
        assert!(state.feed(b"data: [DONE]\n\n", &sink).unwrap());

        let result = state.into_result(&request, "openai").unwrap();
        assert_eq!(result.text, "Hi there");
        assert_eq!(result.model, "gpt-4o-mini-2024");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.usage.total_tokens, 6);

        assert_eq!(rx.recv().await.unwrap().delta, "Hi");
        assert_eq!(rx.recv().await.unwrap().delta, " there");
        assert_eq!(rx.recv().await.unwrap().finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_truncated_stream_is_transient() {
        let (sink, _rx) = sink();
        let mut state = StreamState::new("gpt-4o-mini");
        state.feed(DELTA_HI.as_bytes(), &sink).unwrap();
        state.feed(DELTA_THERE.as_bytes(), &sink).unwrap();

        let err = state
            .into_result(&GenerationRequest::new("Hello"), "openai")
            .unwrap_err();
        assert_eq!(err.kind, crate::models::provider::ProviderErrorKind::Transient);
    }

    #[test]
    fn test_stream_with_finish_reason_but_no_done_completes() {
        let (sink, _rx) = sink();
        let mut state = StreamState::new("gpt-4o-mini");
        state.feed(DELTA_HI.as_bytes(), &sink).unwrap();
        state.feed(FINISH.as_bytes(), &sink).unwrap();

        let result = state.into_result(&GenerationRequest::new("Hello"), "openai").unwrap();
        assert_eq!(result.text, "Hi");
    }

    #[test]
    fn test_response_mapping() {
        let response: OpenAIResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        }))
        .unwrap();

        let request = GenerationRequest::new("Hi");
        let result = response.into_result(&request, "openai").unwrap();
        assert_eq!(result.text, "Hello!");
        assert_eq!(result.provider, "openai");
        assert_eq!(result.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(result.request_id, request.id);
        assert_eq!(result.usage.total_tokens, 12);
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_response_without_choices_is_fatal() {
        let response: OpenAIResponse = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": []
        }))
        .unwrap();

        let err = response.into_result(&GenerationRequest::new("Hi"), "openai").unwrap_err();
        assert_eq!(err.kind, crate::models::provider::ProviderErrorKind::Fatal);
    }
}
