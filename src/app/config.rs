use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::fallback::{BackoffPolicy, ExplicitProviderPolicy, FallbackConfig};
use crate::models::provider::{GenerationParams, ProviderConfig, ProviderKind};

const ENV_PREFIX: &str = "MODELRELAY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: Vec<ProviderConfig>,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Falls back to the first priority entry when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    /// Empty means declaration order of `providers`.
    pub priority: Vec<String>,
    pub max_retries: u32,
    pub max_provider_attempts: usize,
    pub rate_limit_cooldown_secs: u64,
    pub backoff_base_delay_ms: u64,
    pub backoff_max_delay_ms: u64,
    pub backoff_jitter: bool,
    /// 0 disables the per-call timeout.
    pub request_timeout_ms: u64,
    pub explicit_provider_policy: ExplicitProviderPolicy,
    pub stream_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let providers = vec![
            ProviderConfig {
                name: "openai".to_string(),
                kind: ProviderKind::OpenAI,
                api_key: None,
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                model: "gpt-4o-mini".to_string(),
                base_url: None,
                defaults: GenerationParams {
                    temperature: Some(0.7),
                    max_tokens: Some(2048),
                    top_p: None,
                },
            },
            ProviderConfig {
                name: "anthropic".to_string(),
                kind: ProviderKind::Anthropic,
                api_key: None,
                api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
                model: "claude-3-5-haiku-latest".to_string(),
                base_url: None,
                defaults: GenerationParams {
                    temperature: Some(0.7),
                    max_tokens: Some(2048),
                    top_p: None,
                },
            },
        ];

        Self {
            providers,
            dispatch: DispatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            priority: Vec::new(),
            max_retries: 3,
            max_provider_attempts: 3,
            rate_limit_cooldown_secs: 60,
            backoff_base_delay_ms: 1000,
            backoff_max_delay_ms: 30000,
            backoff_jitter: false,
            request_timeout_ms: 120000,
            explicit_provider_policy: ExplicitProviderPolicy::FailFast,
            stream_buffer: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl AppConfig {
    /// Reads `path` (if present) and layers `MODELRELAY_*` environment
    /// variables on top, e.g. `MODELRELAY_DISPATCH__MAX_RETRIES=5`.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
        } else {
            info!("Config file {:?} not found, using defaults", path);
        }

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(Error::validation("Provider with empty name"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(Error::validation(format!("Duplicate provider name: {}", provider.name)));
            }
            if provider.model.trim().is_empty() {
                return Err(Error::validation(format!("Provider {} has empty model", provider.name)));
            }
        }

        for name in &self.dispatch.priority {
            if !names.contains(name.as_str()) {
                return Err(Error::validation(format!(
                    "Priority list references unknown provider: {}",
                    name
                )));
            }
        }

        if let Some(default) = &self.dispatch.default_provider {
            if !names.contains(default.as_str()) {
                return Err(Error::validation(format!("Unknown default provider: {}", default)));
            }
        }

        let dispatch = &self.dispatch;
        if dispatch.max_retries == 0 {
            return Err(Error::validation("max_retries must be at least 1"));
        }
        if dispatch.max_provider_attempts == 0 {
            return Err(Error::validation("max_provider_attempts must be at least 1"));
        }
        if dispatch.backoff_base_delay_ms > dispatch.backoff_max_delay_ms {
            return Err(Error::validation("backoff_base_delay_ms must not exceed backoff_max_delay_ms"));
        }
        if dispatch.stream_buffer == 0 {
            return Err(Error::validation("stream_buffer must be greater than 0"));
        }

        Ok(())
    }

    pub fn default_provider(&self) -> String {
        self.dispatch
            .default_provider
            .clone()
            .or_else(|| self.dispatch.priority.first().cloned())
            .or_else(|| self.providers.first().map(|p| p.name.clone()))
            .unwrap_or_default()
    }

    /// Configured priority, or declaration order when none is given.
    pub fn priority(&self) -> Vec<String> {
        if self.dispatch.priority.is_empty() {
            self.providers.iter().map(|p| p.name.clone()).collect()
        } else {
            self.dispatch.priority.clone()
        }
    }

    pub fn to_fallback_config(&self) -> FallbackConfig {
        let dispatch = &self.dispatch;
        FallbackConfig {
            max_retries: dispatch.max_retries,
            max_provider_attempts: dispatch.max_provider_attempts,
            rate_limit_cooldown: Duration::from_secs(dispatch.rate_limit_cooldown_secs),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(dispatch.backoff_base_delay_ms),
                max_delay: Duration::from_millis(dispatch.backoff_max_delay_ms),
                jitter: dispatch.backoff_jitter,
            },
            request_timeout: (dispatch.request_timeout_ms > 0)
                .then(|| Duration::from_millis(dispatch.request_timeout_ms)),
            explicit_provider_policy: dispatch.explicit_provider_policy,
        }
    }
}
