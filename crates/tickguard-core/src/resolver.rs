//! Provider fallback chain.
//!
//! [`PriceResolver::resolve`] answers from a fresh cache entry when it can.
//! Otherwise it walks providers in ascending priority. Each provider is gated
//! by its circuit breaker, bounded by its concurrency limiter and called
//! through the shared retry policy. The first success is cached and returned.
//! When every provider is skipped or fails, a stale cache entry is served as
//! a degraded result; with nothing cached the call fails with
//! [`ResolveError::AllProvidersExhausted`].

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

use crate::adapters::{CoinGeckoAdapter, CoinbaseAdapter, KrakenAdapter};
use crate::cache::{CacheLookup, PriceCache};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::{ProviderConfig, TickguardConfig};
use crate::data_source::{PriceSource, SourceError};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::limiter::{ConcurrencyLimiter, LimiterError};
use crate::provider_policy::ProviderPolicy;
use crate::retry::RetryPolicy;
use crate::{
    AssetId, ConfigError, PairKey, PricePoint, ProviderId, ProviderKind, QuoteCurrency,
    UtcDateTime, ValidationError,
};

/// How old a cached value may be and still be served without a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Fresh while younger than the cache TTL.
    #[default]
    Ttl,
    /// Fresh while younger than both this bound and the cache TTL.
    MaxAge(Duration),
    /// Any cached value is acceptable; stale ones are flagged degraded.
    AllowStale,
    /// Skip the cache read and go upstream. A stale entry is still the
    /// fallback when every provider fails.
    Refresh,
}

impl Freshness {
    fn admits(self, lookup: &CacheLookup) -> bool {
        match self {
            Self::MaxAge(max_age) => lookup.is_fresh && lookup.age <= max_age,
            Self::Ttl | Self::AllowStale | Self::Refresh => lookup.is_fresh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub pair: PairKey,
    pub freshness: Freshness,
}

impl ResolutionRequest {
    pub fn new(pair: PairKey) -> Self {
        Self {
            pair,
            freshness: Freshness::Ttl,
        }
    }

    pub fn parse(asset: &str, quote: &str) -> Result<Self, ValidationError> {
        Ok(Self::new(PairKey::parse(asset, quote)?))
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }
}

/// Why one provider did not produce the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: ProviderId,
    pub error: SourceError,
    /// Upstream calls made; zero when the provider was skipped.
    pub attempts: u32,
}

impl ProviderFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

/// Outcome of a successful resolution.
///
/// `degraded == false` means the value is fresh (from a provider or a fresh
/// cache hit). `degraded == true` means every provider failed or was skipped
/// and the value is a stale cache entry; `warnings` says why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionResult {
    pub pair: PairKey,
    pub value: Decimal,
    pub provider: ProviderId,
    pub from_cache: bool,
    pub degraded: bool,
    pub fetched_at: UtcDateTime,
    pub age: Duration,
    /// Providers actually called, in order.
    pub source_chain: Vec<ProviderId>,
    pub warnings: Vec<String>,
    pub failures: Vec<ProviderFailure>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("all providers exhausted for {pair}: {}", summarize(.failures))]
    AllProvidersExhausted {
        pair: PairKey,
        failures: Vec<ProviderFailure>,
    },
    #[error("resolution task for {pair} did not complete: {reason}")]
    TaskFailed { pair: PairKey, reason: String },
}

impl ResolveError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AllProvidersExhausted { .. } => "resolver.all_providers_exhausted",
            Self::TaskFailed { .. } => "resolver.task_failed",
        }
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return String::from("no providers configured");
    }
    let mut summary = String::new();
    for (index, failure) in failures.iter().enumerate() {
        if index > 0 {
            summary.push_str("; ");
        }
        let _ = write!(summary, "{}: {}", failure.provider, failure.code());
    }
    summary
}

/// Process-lifetime counters for the resolver.
#[derive(Debug, Default)]
pub struct ResolverMetrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    upstream_calls: AtomicU64,
    provider_failures: AtomicU64,
    providers_skipped: AtomicU64,
    fallbacks: AtomicU64,
    degraded: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub provider_failures: u64,
    pub providers_skipped: u64,
    pub fallbacks: u64,
    pub degraded: u64,
    pub exhausted: u64,
}

impl ResolverMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            providers_skipped: self.providers_skipped.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Provider state for the `sources` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSnapshot {
    pub id: ProviderId,
    pub priority: u32,
    pub breaker: BreakerSnapshot,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub available_permits: usize,
}

struct ProviderSlot {
    source: Arc<dyn PriceSource>,
    policy: ProviderPolicy,
    breaker: CircuitBreaker,
    limiter: ConcurrencyLimiter,
}

impl ProviderSlot {
    fn new(source: Arc<dyn PriceSource>, policy: ProviderPolicy) -> Self {
        let breaker = CircuitBreaker::new(policy.provider_id.clone(), policy.breaker);
        let mut limiter = ConcurrencyLimiter::new(
            policy.provider_id.clone(),
            policy.max_concurrency,
            policy.acquire_timeout,
        );
        if let Some(quota) = policy.quota {
            limiter = limiter.with_quota(quota);
        }
        Self {
            source,
            policy,
            breaker,
            limiter,
        }
    }

    fn id(&self) -> &ProviderId {
        &self.policy.provider_id
    }
}

/// Multi-provider price resolver. Share it behind an `Arc`.
pub struct PriceResolver {
    slots: Vec<ProviderSlot>,
    cache: PriceCache,
    retry: RetryPolicy,
    metrics: ResolverMetrics,
}

impl std::fmt::Debug for PriceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceResolver")
            .field(
                "providers",
                &self.slots.iter().map(ProviderSlot::id).collect::<Vec<_>>(),
            )
            .field("cache_ttl", &self.cache.ttl())
            .field("retry", &self.retry)
            .finish()
    }
}

impl PriceResolver {
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::new()
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Provider ids in the order they are tried.
    pub fn provider_order(&self) -> Vec<ProviderId> {
        self.slots.iter().map(|slot| slot.id().clone()).collect()
    }

    pub fn provider_snapshots(&self) -> Vec<ProviderSnapshot> {
        self.slots
            .iter()
            .map(|slot| ProviderSnapshot {
                id: slot.id().clone(),
                priority: slot.policy.priority,
                breaker: slot.breaker.snapshot(),
                max_concurrency: slot.limiter.max_concurrency(),
                in_flight: slot.limiter.in_flight(),
                available_permits: slot.limiter.available(),
            })
            .collect()
    }

    /// Resolve `asset` priced in `quote` with the default freshness.
    pub async fn resolve_pair(
        &self,
        asset: AssetId,
        quote: QuoteCurrency,
    ) -> Result<ResolutionResult, ResolveError> {
        self.resolve(&ResolutionRequest::new(PairKey::new(asset, quote)))
            .await
    }

    pub async fn resolve(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolutionResult, ResolveError> {
        let started = Instant::now();
        let pair = &request.pair;
        ResolverMetrics::bump(&self.metrics.requests);

        if request.freshness != Freshness::Refresh {
            match self.cache.get(pair) {
                Some(lookup) if request.freshness.admits(&lookup) => {
                    ResolverMetrics::bump(&self.metrics.cache_hits);
                    tracing::debug!(
                        pair = %pair,
                        provider = %lookup.price.provider,
                        age_ms = lookup.age.as_millis() as u64,
                        "cache.hit"
                    );
                    return Ok(cached_result(lookup, false, Vec::new(), Vec::new(), started));
                }
                Some(lookup) if request.freshness == Freshness::AllowStale => {
                    ResolverMetrics::bump(&self.metrics.cache_hits);
                    tracing::debug!(
                        pair = %pair,
                        age_ms = lookup.age.as_millis() as u64,
                        "cache.stale"
                    );
                    let warning = stale_warning(&lookup, "caller accepted a stale value");
                    return Ok(cached_result(lookup, true, vec![warning], Vec::new(), started));
                }
                Some(lookup) => {
                    ResolverMetrics::bump(&self.metrics.cache_misses);
                    tracing::debug!(
                        pair = %pair,
                        age_ms = lookup.age.as_millis() as u64,
                        "cache.stale"
                    );
                }
                None => {
                    ResolverMetrics::bump(&self.metrics.cache_misses);
                    tracing::debug!(pair = %pair, "cache.miss");
                }
            }
        }

        let mut source_chain = Vec::with_capacity(self.slots.len());
        let mut failures = Vec::new();

        for slot in &self.slots {
            let provider = slot.id().clone();

            let Some(permit) = slot.breaker.try_acquire() else {
                ResolverMetrics::bump(&self.metrics.providers_skipped);
                tracing::debug!(provider = %provider, pair = %pair, "resolver.skip_open_circuit");
                failures.push(ProviderFailure {
                    error: SourceError::circuit_open(&provider),
                    provider,
                    attempts: 0,
                });
                continue;
            };

            match self.call_provider(slot, pair).await {
                Ok(point) => {
                    permit.success();
                    source_chain.push(provider.clone());
                    self.cache.put(point.clone());

                    let mut warnings = Vec::new();
                    if !failures.is_empty() {
                        ResolverMetrics::bump(&self.metrics.fallbacks);
                        tracing::info!(
                            pair = %pair,
                            provider = %provider,
                            failed = failures.len(),
                            "resolver.fallback"
                        );
                        warnings.push(format!(
                            "resolved by '{provider}' after {} provider failure(s)",
                            failures.len()
                        ));
                    }

                    return Ok(ResolutionResult {
                        pair: point.pair,
                        value: point.value,
                        provider: point.provider,
                        from_cache: false,
                        degraded: false,
                        fetched_at: point.fetched_at,
                        age: Duration::ZERO,
                        source_chain,
                        warnings,
                        failures,
                        latency_ms: elapsed_ms(started),
                    });
                }
                Err(failure) => {
                    permit.failure();
                    if failure.attempts > 0 {
                        source_chain.push(provider);
                    }
                    ResolverMetrics::bump(&self.metrics.provider_failures);
                    failures.push(failure);
                }
            }
        }

        match self.cache.get(pair) {
            // Another task refreshed the pair while this one was failing.
            Some(lookup) if request.freshness.admits(&lookup) => {
                ResolverMetrics::bump(&self.metrics.cache_hits);
                let mut result = cached_result(lookup, false, Vec::new(), failures, started);
                result.source_chain = source_chain;
                Ok(result)
            }
            Some(lookup) => {
                ResolverMetrics::bump(&self.metrics.degraded);
                tracing::warn!(
                    pair = %pair,
                    provider = %lookup.price.provider,
                    age_ms = lookup.age.as_millis() as u64,
                    failed = failures.len(),
                    "resolver.degraded"
                );
                let warning = stale_warning(&lookup, "all providers failed or were skipped");
                let mut result = cached_result(lookup, true, vec![warning], failures, started);
                result.source_chain = source_chain;
                Ok(result)
            }
            None => {
                ResolverMetrics::bump(&self.metrics.exhausted);
                tracing::error!(
                    pair = %pair,
                    failures = %summarize(&failures),
                    "resolver.exhausted"
                );
                Err(ResolveError::AllProvidersExhausted {
                    pair: pair.clone(),
                    failures,
                })
            }
        }
    }

    /// Resolve independent requests concurrently. Results keep request order.
    pub async fn resolve_many(
        self: &Arc<Self>,
        requests: Vec<ResolutionRequest>,
    ) -> Vec<Result<ResolutionResult, ResolveError>> {
        let pairs = requests
            .iter()
            .map(|request| request.pair.clone())
            .collect::<Vec<_>>();
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let resolver = Arc::clone(self);
            tasks.spawn(async move { (index, resolver.resolve(&request).await) });
        }

        let mut ordered: Vec<Option<Result<ResolutionResult, ResolveError>>> =
            (0..pairs.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => ordered[index] = Some(result),
                Err(error) => tracing::error!(error = %error, "resolver.task_failed"),
            }
        }

        ordered
            .into_iter()
            .zip(pairs)
            .map(|(slot, pair)| {
                slot.unwrap_or_else(|| {
                    Err(ResolveError::TaskFailed {
                        pair,
                        reason: String::from("task panicked or was cancelled"),
                    })
                })
            })
            .collect()
    }

    /// One provider attempt: limiter permit, then the retried fetch.
    ///
    /// The limiter permit is held for the whole retry sequence and released
    /// before the caller reports the outcome to the breaker.
    async fn call_provider(
        &self,
        slot: &ProviderSlot,
        pair: &PairKey,
    ) -> Result<PricePoint, ProviderFailure> {
        let provider = slot.id();

        let _permit = slot.limiter.acquire().await.map_err(|error| {
            let waited = match error {
                LimiterError::Timeout { waited } => waited,
                LimiterError::Closed => Duration::ZERO,
            };
            ProviderFailure {
                provider: provider.clone(),
                error: SourceError::limiter_timeout(provider, waited),
                attempts: 0,
            }
        })?;

        let source: &dyn PriceSource = slot.source.as_ref();
        let upstream_calls = &self.metrics.upstream_calls;
        let span = tracing::debug_span!("provider", provider = %provider, pair = %pair);

        let outcome = self
            .retry
            .execute(move |_attempt| {
                ResolverMetrics::bump(upstream_calls);
                source.fetch(pair)
            })
            .instrument(span)
            .await;

        match outcome {
            Ok(price) => Ok(PricePoint::new(pair.clone(), price, provider.clone())),
            Err(exhausted) => {
                tracing::warn!(
                    provider = %provider,
                    pair = %pair,
                    attempts = exhausted.attempts,
                    code = exhausted.last.code(),
                    error = %exhausted.last,
                    "resolver.provider_failed"
                );
                Err(ProviderFailure {
                    provider: provider.clone(),
                    attempts: exhausted.attempts,
                    error: exhausted.last,
                })
            }
        }
    }
}

fn cached_result(
    lookup: CacheLookup,
    degraded: bool,
    warnings: Vec<String>,
    failures: Vec<ProviderFailure>,
    started: Instant,
) -> ResolutionResult {
    ResolutionResult {
        pair: lookup.price.pair,
        value: lookup.price.value,
        provider: lookup.price.provider,
        from_cache: true,
        degraded,
        fetched_at: lookup.price.fetched_at,
        age: lookup.age,
        source_chain: Vec::new(),
        warnings,
        failures,
        latency_ms: elapsed_ms(started),
    }
}

fn stale_warning(lookup: &CacheLookup, why: &str) -> String {
    format!(
        "{why}; serving cached value from '{}' aged {}s",
        lookup.price.provider,
        lookup.age.as_secs()
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Assembles a [`PriceResolver`].
///
/// Providers are ordered by ascending priority; equal priorities keep
/// registration order.
///
/// ```rust,ignore
/// let resolver = PriceResolver::builder()
///     .with_config(&config)?
///     .build()?;
/// ```
#[derive(Default)]
pub struct ResolverBuilder {
    sources: Vec<(Arc<dyn PriceSource>, ProviderPolicy)>,
    cache: Option<PriceCache>,
    retry: RetryPolicy,
    http_client: Option<Arc<dyn HttpClient>>,
}

impl ResolverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider with explicit policy.
    pub fn with_source(mut self, source: Arc<dyn PriceSource>, policy: ProviderPolicy) -> Self {
        self.sources.push((source, policy));
        self
    }

    pub fn with_cache(mut self, cache: PriceCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Transport for adapters created by [`with_config`](Self::with_config).
    /// Defaults to a shared reqwest client.
    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Create adapters, cache and retry policy from configuration.
    ///
    /// API keys are read from each provider's `api_key_env` variable.
    pub fn with_config(mut self, config: &TickguardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let http_client = self
            .http_client
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));

        for provider in config.enabled_providers() {
            let source = adapter_for(provider, Arc::clone(&http_client));
            self.sources.push((source, provider.policy()));
        }

        self.cache = Some(config.cache.build());
        self.retry = config.retry.policy();
        Ok(self)
    }

    pub fn build(self) -> Result<PriceResolver, ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = HashSet::new();
        for (source, policy) in &self.sources {
            if source.id() != policy.provider_id {
                return Err(ConfigError::invalid(
                    format!("providers.{}", policy.provider_id),
                    format!("policy is for '{}' but source reports '{}'", policy.provider_id, source.id()),
                ));
            }
            if !seen.insert(policy.provider_id.clone()) {
                return Err(ConfigError::DuplicateProvider {
                    id: policy.provider_id.to_string(),
                });
            }
        }

        let mut sources = self.sources;
        sources.sort_by_key(|(_, policy)| policy.priority);

        let slots = sources
            .into_iter()
            .map(|(source, policy)| ProviderSlot::new(source, policy))
            .collect::<Vec<_>>();

        tracing::debug!(
            providers = %slots.iter().map(|slot| slot.id().as_str()).collect::<Vec<_>>().join(","),
            "resolver.built"
        );

        Ok(PriceResolver {
            slots,
            cache: self.cache.unwrap_or_else(PriceCache::with_default_ttl),
            retry: self.retry,
            metrics: ResolverMetrics::default(),
        })
    }
}

fn adapter_for(provider: &ProviderConfig, http_client: Arc<dyn HttpClient>) -> Arc<dyn PriceSource> {
    let id = provider.provider_id();
    let timeout = provider.request_timeout();
    match provider.kind {
        ProviderKind::Coingecko => {
            let mut adapter = CoinGeckoAdapter::with_http_client(http_client)
                .with_id(id)
                .with_timeout(timeout);
            if let Some(base_url) = &provider.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            if let Some(api_key) = provider.api_key() {
                adapter = adapter.with_api_key(api_key);
            }
            Arc::new(adapter)
        }
        ProviderKind::Coinbase => {
            let mut adapter = CoinbaseAdapter::with_http_client(http_client)
                .with_id(id)
                .with_timeout(timeout);
            if let Some(base_url) = &provider.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            Arc::new(adapter)
        }
        ProviderKind::Kraken => {
            let mut adapter = KrakenAdapter::with_http_client(http_client)
                .with_id(id)
                .with_timeout(timeout);
            if let Some(base_url) = &provider.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            Arc::new(adapter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{ScriptedSource, SourceErrorKind};
    use crate::http_client::{HttpResponse, ScriptedHttpClient};
    use crate::CircuitState;
    use rust_decimal_macros::dec;

    fn id(value: &str) -> ProviderId {
        ProviderId::parse(value).expect("valid id")
    }

    fn btc() -> ResolutionRequest {
        ResolutionRequest::parse("BTC", "USD").expect("valid pair")
    }

    fn resolver_with(sources: Vec<Arc<ScriptedSource>>) -> PriceResolver {
        sources
            .into_iter()
            .enumerate()
            .fold(
                PriceResolver::builder().with_retry(RetryPolicy::fixed(Duration::from_millis(10), 2)),
                |builder, (priority, source)| {
                    let policy = ProviderPolicy::new(source.id(), priority as u32);
                    builder.with_source(source, policy)
                },
            )
            .build()
            .expect("valid resolver")
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins_and_is_cached() {
        let source = Arc::new(ScriptedSource::always(id("a"), dec!(67000.5)));
        let resolver = resolver_with(vec![Arc::clone(&source)]);

        let first = resolver.resolve(&btc()).await.expect("resolved");
        assert_eq!(first.value, dec!(67000.5));
        assert!(!first.from_cache);
        assert!(!first.degraded);

        let second = resolver.resolve(&btc()).await.expect("resolved");
        assert!(second.from_cache);
        assert_eq!(source.calls(), 1);
        assert_eq!(resolver.metrics().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_counted_once() {
        let flaky = Arc::new(ScriptedSource::failing(
            id("flaky"),
            SourceError::transient("503"),
        ));
        let backup = Arc::new(ScriptedSource::always(id("backup"), dec!(1)));
        let resolver = resolver_with(vec![Arc::clone(&flaky), Arc::clone(&backup)]);

        let result = resolver.resolve(&btc()).await.expect("backup answers");

        assert_eq!(flaky.calls(), 2);
        assert_eq!(result.failures[0].attempts, 2);
        assert_eq!(result.source_chain, vec![id("flaky"), id("backup")]);
        let snapshot = &resolver.provider_snapshots()[0];
        assert_eq!(snapshot.breaker.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let broken = Arc::new(ScriptedSource::failing(
            id("broken"),
            SourceError::permanent("401"),
        ));
        let resolver = resolver_with(vec![Arc::clone(&broken)]);

        let error = resolver.resolve(&btc()).await.expect_err("nothing cached");

        assert_eq!(broken.calls(), 1);
        assert_eq!(error.code(), "resolver.all_providers_exhausted");
        assert!(error.to_string().contains("broken: source.permanent"));
    }

    #[tokio::test(start_paused = true)]
    async fn max_age_forces_refetch_of_ttl_fresh_entry() {
        let source = Arc::new(ScriptedSource::new(
            id("a"),
            vec![Ok(dec!(1)), Ok(dec!(2))],
        ));
        let resolver = resolver_with(vec![Arc::clone(&source)]);
        resolver.resolve(&btc()).await.expect("seed");

        tokio::time::advance(Duration::from_secs(30)).await;
        let result = resolver
            .resolve(&btc().with_freshness(Freshness::MaxAge(Duration::from_secs(10))))
            .await
            .expect("refetched");

        assert_eq!(result.value, dec!(2));
        assert!(!result.from_cache);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_stale_serves_old_entry_without_network() {
        let source = Arc::new(ScriptedSource::always(id("a"), dec!(5)));
        let resolver = PriceResolver::builder()
            .with_cache(PriceCache::new(Duration::from_secs(5)))
            .with_source(
                Arc::clone(&source) as Arc<dyn PriceSource>,
                ProviderPolicy::new(id("a"), 0),
            )
            .build()
            .expect("valid resolver");
        resolver.resolve(&btc()).await.expect("seed");

        tokio::time::advance(Duration::from_secs(60)).await;
        let result = resolver
            .resolve(&btc().with_freshness(Freshness::AllowStale))
            .await
            .expect("stale ok");

        assert!(result.from_cache);
        assert!(result.degraded);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_bypasses_fresh_cache() {
        let source = Arc::new(ScriptedSource::new(id("a"), vec![Ok(dec!(1)), Ok(dec!(3))]));
        let resolver = resolver_with(vec![Arc::clone(&source)]);
        resolver.resolve(&btc()).await.expect("seed");

        let result = resolver
            .resolve(&btc().with_freshness(Freshness::Refresh))
            .await
            .expect("refreshed");

        assert_eq!(result.value, dec!(3));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_is_skipped_without_a_call() {
        let source = Arc::new(ScriptedSource::failing(id("a"), SourceError::permanent("no")));
        let resolver = PriceResolver::builder()
            .with_retry(RetryPolicy::no_retry())
            .with_source(
                Arc::clone(&source) as Arc<dyn PriceSource>,
                ProviderPolicy::new(id("a"), 0).with_breaker(2, Duration::from_secs(60)),
            )
            .build()
            .expect("valid resolver");

        for _ in 0..3 {
            let _ = resolver.resolve(&btc()).await;
        }

        assert_eq!(source.calls(), 2);
        assert_eq!(
            resolver.provider_snapshots()[0].breaker.state,
            CircuitState::Open
        );
        assert_eq!(resolver.metrics().providers_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_timeout_counts_as_provider_failure() {
        let slow = Arc::new(
            ScriptedSource::always(id("slow"), dec!(1)).with_latency(Duration::from_secs(10)),
        );
        let resolver = Arc::new(
            PriceResolver::builder()
                .with_retry(RetryPolicy::no_retry())
                .with_source(
                    Arc::clone(&slow) as Arc<dyn PriceSource>,
                    ProviderPolicy::new(id("slow"), 0)
                        .with_max_concurrency(1)
                        .with_acquire_timeout(Duration::from_millis(100)),
                )
                .build()
                .expect("valid resolver"),
        );

        let holder = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(&btc()).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let eth = ResolutionRequest::parse("ETH", "USD").expect("valid pair");
        let error = resolver.resolve(&eth).await.expect_err("no permit");
        match error {
            ResolveError::AllProvidersExhausted { failures, .. } => {
                assert_eq!(failures[0].error.kind(), SourceErrorKind::LimiterTimeout);
                assert_eq!(failures[0].attempts, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(resolver.provider_snapshots()[0].breaker.consecutive_failures, 1);

        assert!(holder.await.expect("task").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_many_preserves_request_order() {
        let source = Arc::new(
            ScriptedSource::always(id("a"), dec!(10)).with_latency(Duration::from_millis(5)),
        );
        let resolver = Arc::new(resolver_with(vec![source]));

        let results = resolver
            .resolve_many(vec![
                ResolutionRequest::parse("BTC", "USD").expect("valid"),
                ResolutionRequest::parse("ETH", "EUR").expect("valid"),
                ResolutionRequest::parse("SOL", "USDT").expect("valid"),
            ])
            .await;

        let pairs = results
            .iter()
            .map(|result| result.as_ref().expect("resolved").pair.to_string())
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec!["BTC/USD", "ETH/EUR", "SOL/USDT"]);
    }

    #[test]
    fn builder_rejects_mismatched_and_duplicate_ids() {
        let source: Arc<dyn PriceSource> = Arc::new(ScriptedSource::always(id("a"), dec!(1)));

        assert!(matches!(
            PriceResolver::builder()
                .with_source(Arc::clone(&source), ProviderPolicy::new(id("b"), 0))
                .build(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            PriceResolver::builder()
                .with_source(Arc::clone(&source), ProviderPolicy::new(id("a"), 0))
                .with_source(source, ProviderPolicy::new(id("a"), 1))
                .build(),
            Err(ConfigError::DuplicateProvider { .. })
        ));
        assert!(matches!(
            PriceResolver::builder().build(),
            Err(ConfigError::NoProviders)
        ));
    }

    #[tokio::test]
    async fn config_builds_adapters_in_priority_order() {
        let config = TickguardConfig::from_toml_str(
            r#"
            [[providers]]
            kind = "kraken"
            priority = 2

            [[providers]]
            kind = "coinbase"
            priority = 1
            base_url = "https://coinbase.test"
            "#,
        )
        .expect("valid config");
        let http = ScriptedHttpClient::responding(HttpResponse::ok_json(
            r#"{"data":{"amount":"101.25","base":"BTC","currency":"USD"}}"#,
        ));

        let resolver = PriceResolver::builder()
            .with_http_client(http.clone())
            .with_config(&config)
            .expect("config applies")
            .build()
            .expect("valid resolver");

        assert_eq!(resolver.provider_order(), vec![id("coinbase"), id("kraken")]);
        let result = resolver.resolve(&btc()).await.expect("coinbase answers");
        assert_eq!(result.value, dec!(101.25));
        assert_eq!(result.provider, id("coinbase"));
        assert_eq!(
            http.requests()[0].url,
            "https://coinbase.test/v2/prices/BTC-USD/spot"
        );
    }
}
