pub mod provider;
pub mod rate_limiter;
pub mod registry;
pub mod fallback;
pub mod openai;
pub mod anthropic;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::{
    ModelProvider, GenerationRequest, GenerationResult, GenerationParams, ProviderConfig,
    ProviderKind, ProviderError, ProviderErrorKind, ProviderResult, StreamChunk, ChunkSink,
    TokenUsage,
};
pub use rate_limiter::RateLimitTracker;
pub use registry::{build_provider, ProviderRegistry};
pub use fallback::{
    BackoffPolicy, ExplicitProviderPolicy, FallbackConfig, FallbackExecutor, ProviderStats,
};
pub use openai::OpenAIProvider;
pub use anthropic::AnthropicProvider;
