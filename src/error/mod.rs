use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Provider configuration error: {0}")]
    ProviderConfiguration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("All providers exhausted: {0}")]
    Exhausted(DispatchFailure),

    #[error("Fatal provider error: {0}")]
    Fatal(DispatchFailure),

    #[error("Request queue is closed")]
    QueueClosed,
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn provider_configuration(msg: impl Into<String>) -> Self {
        Error::ProviderConfiguration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::Exhausted(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Per-provider failures carried by a dispatch error, if any.
    pub fn dispatch_failure(&self) -> Option<&DispatchFailure> {
        match self {
            Error::Exhausted(failure) | Error::Fatal(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Why a single provider was given up on during one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    RateLimited,
    RetriesExhausted { attempts: u32 },
    Fatal,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "transient failure after {} attempt(s)", attempts)
            }
            FailureReason::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: FailureReason,
    pub message: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.provider, self.reason, self.message)
    }
}

/// Aggregated outcome of a dispatch that produced no result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchFailure {
    pub requested_provider: Option<String>,
    pub failures: Vec<ProviderFailure>,
}

impl DispatchFailure {
    pub fn no_eligible_providers(requested_provider: Option<String>) -> Self {
        Self {
            requested_provider,
            failures: Vec::new(),
        }
    }

    pub fn providers_tried(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.provider.as_str()).collect()
    }
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return match &self.requested_provider {
                Some(name) => write!(f, "provider '{}' is not available or is rate limited", name),
                None => write!(f, "no eligible providers"),
            };
        }

        let parts: Vec<String> = self.failures.iter().map(|failure| failure.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}
