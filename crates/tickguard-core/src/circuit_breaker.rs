use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::{ProviderId, UtcDateTime};

/// Runtime circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting one half-open trial.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<UtcDateTime>,
    next_trial_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            next_trial_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view of a breaker for dashboards and the `sources` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<UtcDateTime>,
    pub cooldown_remaining_ms: Option<u64>,
    pub trial_in_flight: bool,
}

/// Thread-safe circuit breaker guarding one provider.
///
/// Transitions are linearizable: every read-modify-write happens under one
/// mutex that is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderId,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderId, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Whether a call may go upstream right now.
    ///
    /// `Closed` always admits. `Open` admits nothing until the cooldown has
    /// elapsed, then moves to `HalfOpen` and admits exactly one trial. While
    /// that trial is unresolved every other caller is denied.
    pub fn permitted(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`permitted`](Self::permitted) but returns a guard that releases
    /// an unresolved half-open trial if the caller is dropped mid-call.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let trial = self.admit()?;
        Some(BreakerPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Admits a call, reporting whether it is the half-open trial.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            }
            CircuitState::Open => {
                // An open circuit without a deadline never admits a trial.
                let cooled_down = inner
                    .next_trial_at
                    .is_some_and(|at| Instant::now() >= at);

                if cooled_down {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    /// Records a success as the outcome of the current trial, closing the
    /// circuit from any state.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        inner.next_trial_at = None;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Records a failure. In `HalfOpen` it is taken as the trial's outcome
    /// and reopens the circuit.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(UtcDateTime::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.next_trial_at = self.next_trial_deadline();
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.next_trial_at = self.next_trial_deadline();
                self.transition(&mut inner, CircuitState::Open);
            }
            // Late failures from calls admitted before the circuit opened
            // neither extend nor shorten the running cooldown.
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Settles a call that was admitted while the circuit was closed.
    ///
    /// Once a trial is running only the trial decides the half-open outcome,
    /// so a stale failure is counted and a stale success changes nothing.
    fn record_outside_trial(&self, success: bool) {
        {
            let mut inner = self.lock();
            if inner.state == CircuitState::HalfOpen {
                if !success {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure_at = Some(UtcDateTime::now());
                }
                tracing::debug!(
                    provider = %self.provider,
                    success,
                    "breaker.stale_outcome"
                );
                return;
            }
        }
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    fn next_trial_deadline(&self) -> Option<Instant> {
        let deadline = Instant::now().checked_add(self.config.cooldown);
        if deadline.is_none() {
            tracing::warn!(
                provider = %self.provider,
                cooldown_secs = self.config.cooldown.as_secs(),
                "breaker.cooldown_overflow"
            );
        }
        deadline
    }

    /// Frees the half-open trial slot without recording an outcome.
    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            tracing::debug!(provider = %self.provider, "breaker.trial_abandoned");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let cooldown_remaining_ms = match inner.state {
            CircuitState::Open => inner.next_trial_at.map(|at| {
                at.saturating_duration_since(Instant::now()).as_millis() as u64
            }),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            cooldown_remaining_ms,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => tracing::warn!(
                provider = %self.provider,
                from = from.as_str(),
                to = to.as_str(),
                consecutive_failures = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "breaker.transition"
            ),
            CircuitState::Closed | CircuitState::HalfOpen => tracing::info!(
                provider = %self.provider,
                from = from.as_str(),
                to = to.as_str(),
                "breaker.transition"
            ),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled (e.g. the resolution was cancelled) records nothing
/// but frees a half-open trial so the provider can be tried again.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit holds the half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.record_success();
        } else {
            self.breaker.record_outside_trial(true);
        }
    }

    pub fn failure(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.record_failure();
        } else {
            self.breaker.record_outside_trial(false);
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            ProviderId::parse("test").expect("valid id"),
            CircuitBreakerConfig {
                failure_threshold,
                cooldown,
            },
        )
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let breaker = breaker(5, Duration::from_secs(60));

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
            assert!(breaker.permitted());
        }

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 5);
        assert!(!breaker.permitted());
    }

    #[test]
    fn success_resets_the_counter() {
        let breaker = breaker(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[test]
    fn transitions_to_half_open_after_cooldown_then_closes_on_success() {
        let breaker = breaker(1, Duration::from_millis(1));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.permitted());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let breaker = breaker(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert!(breaker.permitted());
        assert!(!breaker.permitted());
        assert!(!breaker.permitted());
        assert!(breaker.snapshot().trial_in_flight);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_cooldown() {
        let breaker = breaker(3, Duration::from_millis(30));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.permitted());

        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.permitted());
        let remaining = breaker
            .snapshot()
            .cooldown_remaining_ms
            .expect("open circuit reports cooldown");
        assert!(remaining > 0 && remaining <= 30);
    }

    #[test]
    fn dropped_permit_frees_the_trial_slot() {
        let breaker = breaker(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        let permit = breaker.try_acquire().expect("trial admitted");
        assert!(breaker.try_acquire().is_none());
        drop(permit);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_some());
    }

    #[test]
    fn settled_permit_records_outcome() {
        let breaker = breaker(2, Duration::from_secs(60));

        breaker.try_acquire().expect("closed").failure();
        breaker.try_acquire().expect("closed").failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn stale_failure_during_half_open_leaves_the_trial_in_charge() {
        let breaker = breaker(1, Duration::from_millis(1));
        let stale = breaker.try_acquire().expect("closed");
        assert!(!stale.is_trial());

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        let trial = breaker.try_acquire().expect("trial admitted");
        assert!(trial.is_trial());

        stale.failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert!(snapshot.trial_in_flight);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert!(breaker.try_acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn stale_success_during_half_open_does_not_close() {
        let breaker = breaker(1, Duration::from_millis(1));
        let stale = breaker.try_acquire().expect("closed");
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        let trial = breaker.try_acquire().expect("trial admitted");

        stale.success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.snapshot().trial_in_flight);

        trial.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn dropping_a_stale_permit_keeps_the_trial_slot_taken() {
        let breaker = breaker(1, Duration::from_millis(1));
        let stale = breaker.try_acquire().expect("closed");
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        let _trial = breaker.try_acquire().expect("trial admitted");

        drop(stale);

        assert!(breaker.snapshot().trial_in_flight);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn oversized_cooldown_opens_without_panicking() {
        let breaker = breaker(1, Duration::from_secs(u64::MAX));

        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.permitted());
        assert_eq!(breaker.snapshot().cooldown_remaining_ms, None);
    }
}
