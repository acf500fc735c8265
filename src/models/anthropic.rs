use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    parse_base_url, GenerationParams, GenerationRequest, GenerationResult, ModelProvider,
    ProviderConfig, ProviderError, ProviderResult, TokenUsage,
};

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
// The messages API requires max_tokens on every request.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    defaults: GenerationParams,
}

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            Error::provider_configuration(format!("Provider '{}' has no API key", config.name))
        })?;
        let base_url =
            parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_ANTHROPIC_BASE_URL))?;

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

    fn build_body(&self, request: &GenerationRequest) -> AnthropicRequest {
        let params = self.defaults.merged(&request.params);

        AnthropicRequest {
            model: self.model.clone(),
            system: request.system_prompt.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: params.temperature,
            top_p: params.top_p,
        }
    }

    async fn make_request(&self, body: &AnthropicRequest) -> ProviderResult<AnthropicResponse> {
        debug!("Making {} API request to model: {}", self.name, body.model);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let anthropic_response: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::fatal(format!("Failed to parse response: {}", e)))?;

            debug!("Received successful response from {}", self.name);
            Ok(anthropic_response)
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            warn!("{} API error: {} - {}", self.name, status, error_text);
            Err(ProviderError::from_status(status.as_u16(), &error_text))
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn get_provider_name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GenerationResult> {
        let response = self.make_request(&self.build_body(request)).await?;
        Ok(response.into_result(request, &self.name))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

impl AnthropicResponse {
    fn into_result(self, request: &GenerationRequest, provider: &str) -> GenerationResult {
        let text = self.text();
        let usage = self
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        GenerationResult::new(request, provider, &self.model, text)
            .with_usage(usage)
            .with_finish_reason(self.stop_reason)
    }

    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
