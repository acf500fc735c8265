use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::anthropic::AnthropicProvider;
use crate::models::openai::OpenAIProvider;
use crate::models::provider::{ModelProvider, ProviderConfig, ProviderKind};
use crate::models::rate_limiter::RateLimitTracker;

/// Constructs the adapter for one configured provider.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    let provider: Arc<dyn ModelProvider> = match config.kind {
        ProviderKind::OpenAI => Arc::new(OpenAIProvider::from_config(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(config)?),
    };
    Ok(provider)
}

/// Configured providers plus the default and fallback ordering. Immutable once
/// built; shared read-only between the queue worker and queue handles.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default_provider: String,
    priority: Vec<String>,
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>, priority: Vec<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
            priority,
        }
    }

    /// Builds every configured provider, skipping the ones that fail to
    /// construct so the rest stay usable.
    pub fn from_configs(
        configs: &[ProviderConfig],
        default_provider: impl Into<String>,
        priority: Vec<String>,
    ) -> Self {
        let mut registry = Self::new(default_provider, priority);

        for config in configs {
            match build_provider(config) {
                Ok(provider) => {
                    debug!("{} provider '{}' initialized", config.kind, config.name);
                    registry.register(provider);
                }
                Err(e) => {
                    warn!("Skipping provider '{}': {}", config.name, e);
                }
            }
        }

        info!("Initialized {} of {} configured providers", registry.len(), configs.len());
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let name = provider.get_provider_name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            warn!("Provider '{}' registered twice, keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ModelProvider>> {
        self.providers.get(name)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    fn is_provider_available(&self, name: &str) -> bool {
        self.providers
            .get(name)
            .map(|provider| provider.is_available())
            .unwrap_or(false)
    }

    /// Available providers in priority order, then any others by name.
    pub fn available_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in &self.priority {
            if self.is_provider_available(name) && !names.contains(name) {
                names.push(name.clone());
            }
        }

        let mut rest: Vec<String> = self
            .providers
            .iter()
            .filter(|(name, provider)| provider.is_available() && !names.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        rest.sort();
        names.extend(rest);
        names
    }

    pub fn has_available_providers(&self) -> bool {
        self.providers.values().any(|provider| provider.is_available())
    }

    /// Ordered list of providers eligible for one dispatch.
    ///
    /// An explicit provider is a hard preference: it is returned alone when
    /// eligible and nothing is returned otherwise.
    pub fn build_priority_order(
        &self,
        explicit: Option<&str>,
        tracker: &RateLimitTracker,
    ) -> Vec<String> {
        let eligible = |name: &str| self.is_provider_available(name) && !tracker.is_rate_limited(name);

        if let Some(name) = explicit {
            if eligible(name) {
                return vec![name.to_string()];
            }
            debug!("Explicit provider '{}' is not eligible", name);
            return Vec::new();
        }

        let mut order: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.default_provider).chain(self.priority.iter());
        for name in candidates {
            if !order.contains(name) && eligible(name.as_str()) {
                order.push(name.clone());
            }
        }
        order
    }
}
