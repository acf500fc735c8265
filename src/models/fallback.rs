use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{DispatchFailure, Error, FailureReason, ProviderFailure, Result};
use crate::models::provider::{
    ChunkSink, GenerationRequest, GenerationResult, ModelProvider, ProviderError, ProviderErrorKind,
    ProviderResult, StreamChunk,
};
use crate::models::rate_limiter::RateLimitTracker;
use crate::models::registry::ProviderRegistry;

/// What to do when a request names a provider that is cooling down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplicitProviderPolicy {
    #[default]
    FailFast,
    WaitForCooldown,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            delay.mul_f64(factor).min(self.max_delay)
        } else {
            delay
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Total calls allowed per provider before falling back.
    pub max_retries: u32,
    pub max_provider_attempts: usize,
    pub rate_limit_cooldown: Duration,
    pub backoff: BackoffPolicy,
    pub request_timeout: Option<Duration>,
    pub explicit_provider_policy: ExplicitProviderPolicy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_provider_attempts: 3,
            rate_limit_cooldown: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            request_timeout: Some(Duration::from_secs(120)),
            explicit_provider_policy: ExplicitProviderPolicy::FailFast,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub successes: u64,
    pub failures: u64,
    pub rate_limit_hits: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

pub type SharedStats = Arc<RwLock<HashMap<String, ProviderStats>>>;

enum ProviderOutcome {
    Success(GenerationResult),
    GiveUp(ProviderFailure),
    Abort(ProviderFailure),
}

/// Drives one request through the eligible providers with bounded retries,
/// exponential backoff and rate-limit fallback.
pub struct FallbackExecutor {
    registry: Arc<ProviderRegistry>,
    tracker: RateLimitTracker,
    config: FallbackConfig,
    stats: SharedStats,
}

impl FallbackExecutor {
    pub fn new(registry: Arc<ProviderRegistry>, config: FallbackConfig) -> Self {
        Self {
            registry,
            tracker: RateLimitTracker::new(),
            config,
            stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn stats_handle(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    pub async fn execute(
        &mut self,
        request: &GenerationRequest,
        stream: Option<&mpsc::Sender<StreamChunk>>,
    ) -> Result<GenerationResult> {
        let explicit = request.provider.as_deref();
        info!(
            "Dispatching request {} (explicit provider: {:?})",
            request.display_label(),
            explicit
        );

        if let Some(name) = explicit {
            self.wait_for_explicit_cooldown(name).await;
        }

        let order = self.registry.build_priority_order(explicit, &self.tracker);
        if order.is_empty() {
            warn!("No eligible providers for request {}", request.display_label());
            return Err(Error::Exhausted(DispatchFailure::no_eligible_providers(
                explicit.map(str::to_string),
            )));
        }

        let mut failures = Vec::new();
        for provider_name in order.iter().take(self.config.max_provider_attempts.max(1)) {
            let Some(provider) = self.registry.get(provider_name).cloned() else {
                continue;
            };

            match self.run_provider(provider.as_ref(), request, stream).await {
                ProviderOutcome::Success(result) => {
                    info!(
                        "Request {} served by {} ({} tokens)",
                        request.display_label(),
                        provider_name,
                        result.usage.total_tokens
                    );
                    return Ok(result);
                }
                ProviderOutcome::GiveUp(failure) => {
                    warn!("Falling back from {}: {}", provider_name, failure);
                    failures.push(failure);
                }
                ProviderOutcome::Abort(failure) => {
                    error!(
                        "Aborting request {} after fatal error from {}: {}",
                        request.display_label(),
                        provider_name,
                        failure.message
                    );
                    failures.push(failure);
                    return Err(Error::Fatal(DispatchFailure {
                        requested_provider: explicit.map(str::to_string),
                        failures,
                    }));
                }
            }
        }

        error!(
            "All providers exhausted for request {} after trying {}",
            request.display_label(),
            failures.len()
        );
        Err(Error::Exhausted(DispatchFailure {
            requested_provider: explicit.map(str::to_string),
            failures,
        }))
    }

    async fn wait_for_explicit_cooldown(&self, provider_name: &str) {
        if self.config.explicit_provider_policy != ExplicitProviderPolicy::WaitForCooldown {
            return;
        }
        if let Some(remaining) = self.tracker.cooldown_remaining(provider_name) {
            info!(
                "Waiting {:?} for explicitly requested provider {} to cool down",
                remaining, provider_name
            );
            sleep(remaining).await;
        }
    }

    async fn run_provider(
        &mut self,
        provider: &dyn ModelProvider,
        request: &GenerationRequest,
        stream: Option<&mpsc::Sender<StreamChunk>>,
    ) -> ProviderOutcome {
        let name = provider.get_provider_name().to_string();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            debug!("Calling {} (attempt {}/{})", name, attempt, self.config.max_retries);

            let error = match self.call_provider(provider, request, stream, attempt).await {
                Ok(mut result) => {
                    result.provider = name.clone();
                    self.record_success(&name);
                    debug!("{} answered in {:?}", name, started.elapsed());
                    return ProviderOutcome::Success(result);
                }
                Err(error) => error,
            };

            self.record_failure(&name, &error);
            match error.kind {
                ProviderErrorKind::RateLimited => {
                    self.tracker.mark_rate_limited(&name, self.config.rate_limit_cooldown);
                    return ProviderOutcome::GiveUp(ProviderFailure {
                        provider: name,
                        reason: FailureReason::RateLimited,
                        message: error.message,
                    });
                }
                ProviderErrorKind::Transient => {
                    if attempt >= self.config.max_retries {
                        return ProviderOutcome::GiveUp(ProviderFailure {
                            provider: name,
                            reason: FailureReason::RetriesExhausted { attempts: attempt },
                            message: error.message,
                        });
                    }
                    let delay = self.config.backoff.delay_for(attempt);
                    warn!(
                        "Transient failure from {} (attempt {}/{}): {}. Retrying in {:?}",
                        name, attempt, self.config.max_retries, error.message, delay
                    );
                    sleep(delay).await;
                }
                ProviderErrorKind::Fatal => {
                    return ProviderOutcome::Abort(ProviderFailure {
                        provider: name,
                        reason: FailureReason::Fatal,
                        message: error.message,
                    });
                }
            }
        }
    }

    async fn call_provider(
        &self,
        provider: &dyn ModelProvider,
        request: &GenerationRequest,
        stream: Option<&mpsc::Sender<StreamChunk>>,
        attempt: u32,
    ) -> ProviderResult<GenerationResult> {
        let call = async {
            match stream {
                Some(sender) => {
                    let sink = ChunkSink::new(sender.clone(), provider.get_provider_name(), attempt);
                    provider.generate_stream(request, &sink).await
                }
                None => provider.generate(request).await,
            }
        };

        match self.config.request_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::transient(format!(
                    "Request timeout after {}ms",
                    limit.as_millis()
                ))),
            },
            None => call.await,
        }
    }

    fn record_success(&self, provider_name: &str) {
        let mut stats = self.stats.write();
        let entry = stats.entry(provider_name.to_string()).or_default();
        entry.successes += 1;
        entry.last_success = Some(Utc::now());
    }

    fn record_failure(&self, provider_name: &str, error: &ProviderError) {
        let mut stats = self.stats.write();
        let entry = stats.entry(provider_name.to_string()).or_default();
        entry.failures += 1;
        if error.is_rate_limited() {
            entry.rate_limit_hits += 1;
        }
        entry.last_error = Some(error.to_string());
        debug!("Recorded failure for provider: {} (count: {})", provider_name, entry.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::ScriptedProvider;

    fn test_config() -> FallbackConfig {
        FallbackConfig {
            max_retries: 3,
            max_provider_attempts: 3,
            rate_limit_cooldown: Duration::from_secs(60),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(1000),
                jitter: false,
            },
            request_timeout: None,
            explicit_provider_policy: ExplicitProviderPolicy::FailFast,
        }
    }

    fn executor_with(
        providers: Vec<Arc<ScriptedProvider>>,
        priority: &[&str],
        config: FallbackConfig,
    ) -> FallbackExecutor {
        let mut registry = ProviderRegistry::new(
            priority[0],
            priority.iter().map(|s| s.to_string()).collect(),
        );
        for provider in providers {
            registry.register(provider);
        }
        FallbackExecutor::new(Arc::new(registry), config)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: true,
        };
        for _ in 0..20 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_provider_single_call() {
        let a = Arc::new(ScriptedProvider::new("a"));
        let b = Arc::new(ScriptedProvider::new("b"));
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], test_config());

        let request = GenerationRequest::new("hi").with_provider("b");
        let result = executor.execute(&request, None).await.unwrap();

        assert_eq!(result.provider, "b");
        assert_eq!(b.calls(), 1);
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success_retries_once() {
        let a = Arc::new(ScriptedProvider::new("a").with_script(vec![
            Err(ProviderError::transient("503 Service Unavailable")),
            Ok("second time lucky".to_string()),
        ]));
        let config = FallbackConfig {
            max_retries: 2,
            ..test_config()
        };
        let mut executor = executor_with(vec![a.clone()], &["a"], config);

        let started = Instant::now();
        let result = executor.execute(&GenerationRequest::new("hi"), None).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.text, "second time lucky");
        assert_eq!(a.calls(), 2);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_falls_back_without_retry() {
        let a = Arc::new(
            ScriptedProvider::new("a").always_failing(ProviderError::rate_limited("429")),
        );
        let b = Arc::new(ScriptedProvider::new("b"));
        let config = FallbackConfig {
            max_provider_attempts: 2,
            ..test_config()
        };
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], config);

        let result = executor.execute(&GenerationRequest::new("first"), None).await.unwrap();
        assert_eq!(result.provider, "b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert!(executor.tracker().is_rate_limited("a"));

        // A stays excluded until its cooldown elapses.
        executor.execute(&GenerationRequest::new("second"), None).await.unwrap();
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        executor.execute(&GenerationRequest::new("third"), None).await.unwrap();
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_aborts_without_fallback() {
        let a = Arc::new(
            ScriptedProvider::new("a").always_failing(ProviderError::fatal("401 invalid api key")),
        );
        let b = Arc::new(ScriptedProvider::new("b"));
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], test_config());

        let err = executor.execute(&GenerationRequest::new("hi"), None).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
        let failure = err.dispatch_failure().unwrap();
        assert_eq!(failure.failures[0].reason, FailureReason::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_every_provider() {
        let a = Arc::new(ScriptedProvider::new("a").always_failing(ProviderError::transient("timeout")));
        let b = Arc::new(ScriptedProvider::new("b").always_failing(ProviderError::rate_limited("429")));
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], test_config());

        let err = executor.execute(&GenerationRequest::new("hi"), None).await.unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
        let failure = err.dispatch_failure().unwrap();
        assert_eq!(failure.providers_tried(), vec!["a", "b"]);
        assert_eq!(failure.failures[0].reason, FailureReason::RetriesExhausted { attempts: 3 });
        assert_eq!(failure.failures[1].reason, FailureReason::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_attempt_cap() {
        let a = Arc::new(ScriptedProvider::new("a").always_failing(ProviderError::rate_limited("429")));
        let b = Arc::new(ScriptedProvider::new("b").always_failing(ProviderError::rate_limited("429")));
        let c = Arc::new(ScriptedProvider::new("c"));
        let config = FallbackConfig {
            max_provider_attempts: 2,
            ..test_config()
        };
        let mut executor = executor_with(vec![a.clone(), b.clone(), c.clone()], &["a", "b", "c"], config);

        let err = executor.execute(&GenerationRequest::new("hi"), None).await.unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_rate_limited_provider_fails_fast() {
        let a = Arc::new(ScriptedProvider::new("a").with_script(vec![Err(ProviderError::rate_limited("429"))]));
        let b = Arc::new(ScriptedProvider::new("b"));
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], test_config());

        executor.execute(&GenerationRequest::new("warmup"), None).await.unwrap();
        assert!(executor.tracker().is_rate_limited("a"));

        let err = executor
            .execute(&GenerationRequest::new("hi").with_provider("a"), None)
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(
            err.dispatch_failure().unwrap().requested_provider.as_deref(),
            Some("a")
        );
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_rate_limited_provider_waits_when_configured() {
        let a = Arc::new(ScriptedProvider::new("a").with_script(vec![Err(ProviderError::rate_limited("429"))]));
        let b = Arc::new(ScriptedProvider::new("b"));
        let config = FallbackConfig {
            explicit_provider_policy: ExplicitProviderPolicy::WaitForCooldown,
            ..test_config()
        };
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], config);

        executor.execute(&GenerationRequest::new("warmup"), None).await.unwrap();

        let started = Instant::now();
        let result = executor
            .execute(&GenerationRequest::new("hi").with_provider("a"), None)
            .await
            .unwrap();
        assert_eq!(result.provider, "a");
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let a = Arc::new(ScriptedProvider::new("a").with_delay(Duration::from_secs(10)));
        let b = Arc::new(ScriptedProvider::new("b"));
        let config = FallbackConfig {
            max_retries: 1,
            request_timeout: Some(Duration::from_secs(1)),
            ..test_config()
        };
        let mut executor = executor_with(vec![a.clone(), b.clone()], &["a", "b"], config);

        let result = executor.execute(&GenerationRequest::new("hi"), None).await.unwrap();
        assert_eq!(result.provider, "b");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_are_recorded() {
        let a = Arc::new(ScriptedProvider::new("a").always_failing(ProviderError::rate_limited("429")));
        let b = Arc::new(ScriptedProvider::new("b"));
        let mut executor = executor_with(vec![a, b], &["a", "b"], test_config());
        let stats = executor.stats_handle();

        executor.execute(&GenerationRequest::new("hi"), None).await.unwrap();

        let stats = stats.read();
        assert_eq!(stats["a"].rate_limit_hits, 1);
        assert_eq!(stats["a"].failures, 1);
        assert_eq!(stats["b"].successes, 1);
        assert!(stats["b"].last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_chunks_are_tagged() {
        let a = Arc::new(ScriptedProvider::new("a").with_script(vec![
            Err(ProviderError::transient("reset")),
            Ok("done".to_string()),
        ]));
        let mut executor = executor_with(vec![a], &["a"], test_config());
        let (tx, mut rx) = mpsc::channel(8);

        executor.execute(&GenerationRequest::new("hi"), Some(&tx)).await.unwrap();
        drop(tx);

        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.provider, "a");
        assert_eq!(chunk.attempt, 2);
        assert_eq!(chunk.delta, "done");
        assert!(rx.recv().await.is_none());
    }
}
