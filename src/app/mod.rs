pub mod config;
pub mod state;

pub use config::{AppConfig, DispatchConfig, LoggingConfig};
pub use state::{AppState, ProviderStatus, ProviderSummary};
