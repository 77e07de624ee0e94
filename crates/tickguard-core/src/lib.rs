//! # Tickguard Core
//!
//! Resilient crypto price resolution and a portfolio drawdown fail-safe.
//!
//! ## Overview
//!
//! - **Price resolution** across several market-data providers in fixed
//!   priority order, with a per-pair cache
//! - **Circuit breaking** per provider (closed / open / half-open)
//! - **Retry with exponential backoff and jitter** for transient failures
//! - **Bounded concurrency** per provider, with an optional request quota
//! - **Drawdown fail-safe** that halts every trade entry point when the
//!   portfolio falls too far from its peak
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | CoinGecko, Coinbase and Kraken adapters |
//! | [`cache`] | TTL price cache with optional LRU cap |
//! | [`circuit_breaker`] | Per-provider circuit breaker |
//! | [`config`] | TOML configuration |
//! | [`data_source`] | `PriceSource` trait and provider error taxonomy |
//! | [`domain`] | Assets, quote currencies, prices, timestamps |
//! | [`error`] | Validation and configuration errors |
//! | [`failsafe`] | Drawdown monitor and trade gate |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`limiter`] | Per-provider concurrency limiter |
//! | [`provider_policy`] | Static per-provider resilience settings |
//! | [`resolver`] | Provider fallback chain |
//! | [`retry`] | Retry policy |
//! | [`source`] | Provider identifiers |
//! | [`telemetry`] | `tracing` subscriber setup |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tickguard_core::{PriceResolver, ResolutionRequest, TickguardConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TickguardConfig::load_or_default(None)?;
//!     let resolver = PriceResolver::builder().with_config(&config)?.build()?;
//!
//!     let result = resolver.resolve(&ResolutionRequest::parse("BTC", "USD")?).await?;
//!     if result.degraded {
//!         eprintln!("stale price: {:?}", result.warnings);
//!     }
//!     println!("BTC/USD {} via {}", result.value, result.provider);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  CLI / caller   │
//! └────────┬────────┘
//!          │ resolve(asset, quote)
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │  PriceResolver  │────▶│ PriceCache       │
//! └────────┬────────┘     └──────────────────┘
//!          │ per provider, by priority
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ CircuitBreaker  │────▶│ Concurrency      │
//! │                 │     │ Limiter          │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ RetryPolicy     │────▶│ PriceSource      │
//! │                 │     │ (adapter + HTTP) │
//! └─────────────────┘     └──────────────────┘
//!
//! ┌─────────────────┐
//! │ FailSafeMonitor │  checked before every trade
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Callers can always tell a fresh answer from a degraded one from no answer:
//!
//! ```rust,ignore
//! match resolver.resolve(&request).await {
//!     Ok(result) if !result.degraded => { /* fresh */ }
//!     Ok(result) => { /* stale cache value, see result.warnings */ }
//!     Err(ResolveError::AllProvidersExhausted { failures, .. }) => { /* unavailable */ }
//!     Err(other) => { /* task failure */ }
//! }
//! ```
//!
//! ## Security
//!
//! - API keys and the admin reset token come from environment variables and
//!   are redacted from `Debug` output
//! - Monetary values are `rust_decimal::Decimal` end to end

pub mod adapters;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod failsafe;
pub mod http_client;
pub mod limiter;
pub mod provider_policy;
pub mod resolver;
pub mod retry;
pub mod source;
pub mod telemetry;

// Adapter implementations
pub use adapters::{CoinGeckoAdapter, CoinbaseAdapter, KrakenAdapter};

// Caching
pub use cache::{CacheLookup, PriceCache};

// Circuit breaker
pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};

// Configuration
pub use config::{
    CacheConfig, FailSafeConfig, LoggingConfig, ProviderConfig, QuotaConfig, RetryConfig,
    TickguardConfig,
};

// Price source trait and errors
pub use data_source::{FetchFuture, PriceSource, ScriptedSource, SourceError, SourceErrorKind};

// Domain models
pub use domain::{
    parse_decimal, AssetId, PairKey, PricePoint, QuoteCurrency, SourcePrice, UtcDateTime,
};

// Error types
pub use error::{ConfigError, ValidationError};

// Fail-safe
pub use failsafe::{
    AuditAction, AuditEntry, DrawdownSnapshot, FailSafeError, FailSafeMonitor, HaltRecord,
    MonitorStatus, ResetRequest,
};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};

// Concurrency limiting
pub use limiter::{ConcurrencyLimiter, LimiterError, LimiterPermit};

// Provider policies
pub use provider_policy::{ProviderPolicy, QuotaPolicy};

// Resolution
pub use resolver::{
    Freshness, MetricsSnapshot, PriceResolver, ProviderFailure, ProviderSnapshot,
    ResolutionRequest, ResolutionResult, ResolveError, ResolverBuilder,
};

// Retry logic
pub use retry::{Backoff, RetryError, RetryPolicy, Retryable};

// Source identifiers
pub use source::{ProviderId, ProviderKind};
