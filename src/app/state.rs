use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::app::config::AppConfig;
use crate::dispatch::RequestQueue;
use crate::error::Result;
use crate::models::fallback::ProviderStats;
use crate::models::provider::ProviderKind;
use crate::models::registry::ProviderRegistry;

/// Loaded configuration plus the running dispatch queue.
pub struct AppState {
    config: AppConfig,
    config_path: PathBuf,
    queue: RequestQueue,
}

impl AppState {
    /// Builds the provider registry and starts the queue worker. Must be
    /// called from within a tokio runtime.
    pub fn new(config: AppConfig, config_path: PathBuf) -> Result<Self> {
        info!("Initializing application state");
        config.validate()?;

        let registry = ProviderRegistry::from_configs(
            &config.providers,
            config.default_provider(),
            config.priority(),
        );
        let queue = RequestQueue::start(registry, config.to_fallback_config())
            .with_stream_buffer(config.dispatch.stream_buffer);

        Ok(Self {
            config,
            config_path,
            queue,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn provider_stats(&self) -> HashMap<String, ProviderStats> {
        self.queue.stats()
    }

    /// One row per configured provider, in declaration order.
    pub fn provider_statuses(&self) -> Vec<ProviderSummary> {
        let registry = self.queue.registry();
        let default = registry.default_provider();

        self.config
            .providers
            .iter()
            .map(|provider| {
                let handle = registry.get(&provider.name);
                let status = match handle {
                    Some(p) if p.is_available() => ProviderStatus::Ready,
                    Some(_) => ProviderStatus::Unavailable,
                    None => ProviderStatus::MissingCredentials,
                };
                ProviderSummary {
                    name: provider.name.clone(),
                    kind: provider.kind,
                    model: provider.model.clone(),
                    is_default: provider.name == default,
                    streaming: handle.map(|p| p.supports_streaming()).unwrap_or(false),
                    status,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    pub is_default: bool,
    pub streaming: bool,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Ready,
    Unavailable,
    /// The provider could not be built, usually for lack of an API key.
    MissingCredentials,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderStatus::Ready => write!(f, "ready"),
            ProviderStatus::Unavailable => write!(f, "unavailable"),
            ProviderStatus::MissingCredentials => write!(f, "missing credentials"),
        }
    }
}
