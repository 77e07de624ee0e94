use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::{ProviderId, ProviderKind};

/// Static, per-provider resilience settings fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPolicy {
    pub provider_id: ProviderId,
    /// Lower ranks are tried first; ties keep registration order.
    pub priority: u32,
    pub breaker: CircuitBreakerConfig,
    pub max_concurrency: usize,
    /// Longest a resolution waits for a concurrency permit.
    pub acquire_timeout: Duration,
    pub quota: Option<QuotaPolicy>,
}

/// Upstream request quota: at most `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl ProviderPolicy {
    /// Defaults: threshold 5, cooldown 60s, 3 in flight, 5s acquire timeout.
    pub fn new(provider_id: ProviderId, priority: u32) -> Self {
        Self {
            provider_id,
            priority,
            breaker: CircuitBreakerConfig::default(),
            max_concurrency: 3,
            acquire_timeout: Duration::from_secs(5),
            quota: None,
        }
    }

    pub fn with_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreakerConfig {
            failure_threshold,
            cooldown,
        };
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    pub fn with_quota(mut self, limit: u32, window: Duration) -> Self {
        self.quota = Some(QuotaPolicy { limit, window });
        self
    }

    /// CoinGecko public API: roughly 30 calls per minute.
    pub fn coingecko_default(priority: u32) -> Self {
        Self::new(ProviderKind::Coingecko.default_id(), priority)
            .with_quota(30, Duration::from_secs(60))
    }

    /// Coinbase public spot prices: 10,000 requests per hour.
    pub fn coinbase_default(priority: u32) -> Self {
        Self::new(ProviderKind::Coinbase.default_id(), priority)
            .with_quota(10_000, Duration::from_secs(3_600))
    }

    /// Kraken public ticker: about one call per second sustained.
    pub fn kraken_default(priority: u32) -> Self {
        Self::new(ProviderKind::Kraken.default_id(), priority)
            .with_max_concurrency(2)
            .with_quota(60, Duration::from_secs(60))
    }

    pub fn default_for(kind: ProviderKind, priority: u32) -> Self {
        match kind {
            ProviderKind::Coingecko => Self::coingecko_default(priority),
            ProviderKind::Coinbase => Self::coinbase_default(priority),
            ProviderKind::Kraken => Self::kraken_default(priority),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_policy_uses_resilience_defaults() {
        let policy = ProviderPolicy::new(ProviderId::parse("a").expect("valid"), 0);

        assert_eq!(policy.breaker.failure_threshold, 5);
        assert_eq!(policy.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(policy.max_concurrency, 3);
        assert!(policy.quota.is_none());
    }

    #[test]
    fn coingecko_policy_matches_public_tier() {
        let policy = ProviderPolicy::coingecko_default(0);

        assert_eq!(policy.provider_id.as_str(), "coingecko");
        assert_eq!(
            policy.quota,
            Some(QuotaPolicy {
                limit: 30,
                window: Duration::from_secs(60)
            })
        );
    }
}
