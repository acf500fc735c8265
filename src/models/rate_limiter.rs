use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-provider cooldown bookkeeping.
///
/// Owned by the queue worker, so it is never touched concurrently and needs no
/// locking. Expired entries are treated as absent when read; marking a
/// provider also prunes whatever has already expired.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    entries: HashMap<String, Instant>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `now + cooldown` as the provider's expiry, replacing any
    /// earlier mark.
    pub fn mark_rate_limited(&mut self, provider_name: &str, cooldown: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, until| *until > now);

        let until = now + cooldown;
        self.entries.insert(provider_name.to_string(), until);
        info!("Provider {} rate limited for {:?}", provider_name, cooldown);
    }

    pub fn is_rate_limited(&self, provider_name: &str) -> bool {
        match self.entries.get(provider_name) {
            Some(until) => *until > Instant::now(),
            None => false,
        }
    }

    pub fn cooldown_remaining(&self, provider_name: &str) -> Option<Duration> {
        let until = self.entries.get(provider_name)?;
        let now = Instant::now();
        if *until > now {
            Some(*until - now)
        } else {
            debug!("Cooldown for {} has expired", provider_name);
            None
        }
    }

    pub fn rate_limited_providers(&self) -> Vec<String> {
        let now = Instant::now();
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
