use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::provider_policy::QuotaPolicy;
use crate::ProviderId;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Why a permit could not be granted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("timed out after {}ms waiting for a permit", .waited.as_millis())]
    Timeout { waited: Duration },
    #[error("limiter is closed")]
    Closed,
}

/// Per-provider bound on in-flight upstream requests.
///
/// At most `max_concurrency` permits exist; callers beyond that suspend for
/// at most `acquire_timeout`. An optional request quota (requests per window)
/// is enforced inside the same timeout budget.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    provider: ProviderId,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    acquire_timeout: Duration,
    quota: Option<Arc<DirectRateLimiter>>,
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("provider", &self.provider)
            .field("max_concurrency", &self.max_concurrency)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("quota", &self.quota.is_some())
            .finish()
    }
}

impl ConcurrencyLimiter {
    pub fn new(provider: ProviderId, max_concurrency: usize, acquire_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            acquire_timeout,
            quota: None,
        }
    }

    pub fn with_quota(mut self, quota: QuotaPolicy) -> Self {
        self.quota = Some(Arc::new(RateLimiter::direct(quota_from_window(
            quota.window,
            quota.limit,
        ))));
        self
    }

    /// Wait for a permit, bounded by the acquire timeout.
    ///
    /// The permit is released when the returned guard drops.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;

        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(LimiterError::Closed),
            Err(_) => return Err(self.timed_out(started)),
        };

        if let Some(quota) = &self.quota {
            if tokio::time::timeout_at(deadline, quota.until_ready())
                .await
                .is_err()
            {
                return Err(self.timed_out(started));
            }
        }

        Ok(LimiterPermit { _permit: permit })
    }

    fn timed_out(&self, started: Instant) -> LimiterError {
        let waited = started.elapsed();
        tracing::warn!(
            provider = %self.provider,
            waited_ms = waited.as_millis() as u64,
            max_concurrency = self.max_concurrency,
            "limiter.timeout"
        );
        LimiterError::Timeout { waited }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Scoped permit; dropping it frees the slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = NonZeroU32::new(quota_limit.max(1)).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell =
        (quota_window.as_secs_f64() / f64::from(safe_limit.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(safe_limit))
        .allow_burst(safe_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, timeout: Duration) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(ProviderId::parse("test").expect("valid id"), max, timeout)
    }

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let limiter = limiter(2, Duration::from_millis(50));

        let first = limiter.acquire().await.expect("first permit");
        let second = limiter.acquire().await.expect("second permit");
        assert_eq!(limiter.in_flight(), 2);
        assert_eq!(limiter.available(), 0);

        drop(first);
        assert_eq!(limiter.in_flight(), 1);
        drop(second);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_limiter_times_out() {
        let limiter = limiter(1, Duration::from_millis(100));
        let _held = limiter.acquire().await.expect("first permit");

        let error = limiter.acquire().await.expect_err("must time out");
        assert!(matches!(error, LimiterError::Timeout { waited } if waited >= Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_admitted_when_a_permit_frees() {
        let limiter = limiter(1, Duration::from_secs(1));
        let held = limiter.acquire().await.expect("first permit");

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.expect("task completes"), Ok(()));
    }

    #[test]
    fn zero_concurrency_is_clamped_to_one() {
        let limiter = limiter(0, Duration::from_millis(1));
        assert_eq!(limiter.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_counts_as_timeout() {
        let limiter = limiter(4, Duration::from_millis(20)).with_quota(QuotaPolicy {
            limit: 2,
            window: Duration::from_secs(60),
        });

        assert!(limiter.acquire().await.is_ok());
        assert!(limiter.acquire().await.is_ok());
        assert!(matches!(
            limiter.acquire().await,
            Err(LimiterError::Timeout { .. })
        ));
    }
}
