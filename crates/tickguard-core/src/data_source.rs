//! Price source trait and the provider error taxonomy.
//!
//! Every upstream market-data provider is wrapped in a [`PriceSource`]
//! adapter. Adapters own their wire format and hand back a normalized
//! [`SourcePrice`]; the resolver never sees vendor JSON.
//!
//! # Error classes
//!
//! | Kind | Retried | Counted by breaker |
//! |------|---------|--------------------|
//! | [`SourceErrorKind::Transient`] | yes | once, after retries exhaust |
//! | [`SourceErrorKind::RateLimited`] | yes | once, after retries exhaust |
//! | [`SourceErrorKind::Permanent`] | no | immediately |
//! | [`SourceErrorKind::Malformed`] | no | immediately |
//! | [`SourceErrorKind::CircuitOpen`] | no | never (provider skipped) |
//! | [`SourceErrorKind::LimiterTimeout`] | no | immediately |

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::retry::Retryable;
use crate::{PairKey, ProviderId, SourcePrice, ValidationError};

/// Provider error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Network failure, timeout or 5xx-equivalent.
    Transient,
    /// Upstream quota exhausted (429).
    RateLimited,
    /// Auth failure, unknown pair or other 4xx-equivalent.
    Permanent,
    /// Response arrived but could not be parsed into a price.
    Malformed,
    /// Provider skipped because its circuit breaker denied the call.
    CircuitOpen,
    /// Provider skipped because no concurrency permit was granted in time.
    LimiterTimeout,
}

/// Structured provider error used by resolver fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::RateLimited, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Permanent, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Malformed, message)
    }

    pub fn circuit_open(provider: &ProviderId) -> Self {
        Self::new(
            SourceErrorKind::CircuitOpen,
            format!("circuit breaker for '{provider}' is open; skipping upstream call"),
        )
    }

    pub fn limiter_timeout(provider: &ProviderId, waited: Duration) -> Self {
        Self::new(
            SourceErrorKind::LimiterTimeout,
            format!(
                "no concurrency permit for '{provider}' within {}ms",
                waited.as_millis()
            ),
        )
    }

    /// Classify an upstream HTTP status code.
    pub fn from_status(provider: &ProviderId, status: u16) -> Self {
        let message = format!("{provider} upstream returned status {status}");
        match status {
            429 => Self::rate_limited(message),
            408 | 500..=599 => Self::transient(message),
            _ => Self::permanent(message),
        }
    }

    fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Transient | SourceErrorKind::RateLimited
        )
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Transient => "source.transient",
            SourceErrorKind::RateLimited => "source.rate_limited",
            SourceErrorKind::Permanent => "source.permanent",
            SourceErrorKind::Malformed => "source.malformed",
            SourceErrorKind::CircuitOpen => "source.circuit_open",
            SourceErrorKind::LimiterTimeout => "source.limiter_timeout",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        self.retryable()
    }
}

impl From<ValidationError> for SourceError {
    fn from(error: ValidationError) -> Self {
        Self::malformed(error.to_string())
    }
}

/// Boxed future returned by [`PriceSource::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<SourcePrice, SourceError>> + Send + 'a>>;

/// Provider adapter contract.
///
/// Implementations must be `Send + Sync`; the resolver shares one instance
/// across every concurrent resolution.
pub trait PriceSource: Send + Sync {
    /// Provider identifier used for logging, breaker naming and provenance.
    fn id(&self) -> ProviderId;

    /// Fetch the current price of `pair` from upstream.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] classified as transient (retried) or
    /// permanent/malformed (not retried).
    fn fetch<'a>(&'a self, pair: &'a PairKey) -> FetchFuture<'a>;
}

/// Deterministic in-memory source driven by a script of outcomes.
///
/// Outcomes are consumed front to back; once the script is exhausted the
/// last outcome repeats. Records call counts and peak concurrency, which
/// makes it the standard fake for resolver, limiter and CLI dry runs.
#[derive(Debug)]
pub struct ScriptedSource {
    id: ProviderId,
    script: Mutex<VecDeque<Result<Decimal, SourceError>>>,
    last: Mutex<Result<Decimal, SourceError>>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(id: ProviderId, script: Vec<Result<Decimal, SourceError>>) -> Self {
        let last = script
            .last()
            .cloned()
            .unwrap_or_else(|| Err(SourceError::permanent("scripted source has no outcomes")));
        Self {
            id,
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Source that always answers `value`.
    pub fn always(id: ProviderId, value: Decimal) -> Self {
        Self::new(id, vec![Ok(value)])
    }

    /// Source that always fails with `error`.
    pub fn failing(id: ProviderId, error: SourceError) -> Self {
        Self::new(id, vec![Err(error)])
    }

    /// Simulated upstream latency applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<Decimal, SourceError> {
        let mut script = self
            .script
            .lock()
            .expect("scripted source lock is not poisoned");
        match script.pop_front() {
            Some(outcome) => {
                *self
                    .last
                    .lock()
                    .expect("scripted source lock is not poisoned") = outcome.clone();
                outcome
            }
            None => self
                .last
                .lock()
                .expect("scripted source lock is not poisoned")
                .clone(),
        }
    }
}

impl PriceSource for ScriptedSource {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn fetch<'a>(&'a self, pair: &'a PairKey) -> FetchFuture<'a> {
        Box::pin(async move {
            let _ = pair;
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let outcome = self.next_outcome();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            SourcePrice::new(outcome?).map_err(SourceError::from)
        })
    }
}
