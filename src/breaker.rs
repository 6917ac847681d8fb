//! Circuit breaker guarding sink calls, built on lock-free atomics

use crate::error::CircuitOpen;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Millisecond timestamps for cooldown bookkeeping; swappable in tests.
type TimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: closed=0, open=1, half_open=2.
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct BreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
}

/// Three-state fault isolator.
///
/// `closed` admits everything; `failure_threshold` consecutive failures open
/// the circuit; after the cooldown a single trial call is admitted, and its
/// outcome either closes or re-opens the circuit. `half_open` means exactly
/// one trial is outstanding: admission is winning the open-to-half-open CAS,
/// so concurrent callers are refused until the trial records its result.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    failure_threshold: usize,
    cooldown: Duration,
    now_millis: TimeSource,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        let epoch = Instant::now();
        Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
            }),
            failure_threshold,
            cooldown,
            now_millis: Arc::new(move || epoch.elapsed().as_millis() as u64),
        }
    }

    /// Replace the monotonic time source (useful for deterministic tests).
    pub fn with_time_source<F>(mut self, now_millis: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.now_millis = Arc::new(now_millis);
        self
    }

    /// Ask for admission before calling the sink.
    ///
    /// Returns `Err(CircuitOpen)` while the circuit is open and cooling down,
    /// and for every caller but the single trial while half-open.
    pub fn before_call(&self) -> Result<(), CircuitOpen> {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Ok(()),
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = (self.now_millis)().saturating_sub(opened_at);
                    if elapsed < self.cooldown.as_millis() as u64 {
                        return Err(self.refusal());
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // Winning the CAS is the trial admission.
                            tracing::info!("circuit breaker: half-open, admitting trial call");
                            return Ok(());
                        }
                        // Someone else transitioned first; re-read the state.
                        Err(_) => continue,
                    }
                }
                // A trial is outstanding.
                STATE_HALF_OPEN => return Err(self.refusal()),
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    /// Record a successful sink call.
    pub fn record_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: trial succeeded, closed");
                }
            }
            STATE_CLOSED => {
                self.state.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Record a failed sink call.
    pub fn record_failure(&self) {
        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.stamp_opened();
                    tracing::warn!(failures, "circuit breaker: trial failed, open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.stamp_opened();
                    tracing::error!(
                        failures,
                        threshold = self.failure_threshold,
                        "circuit breaker: open"
                    );
                }
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        self.state.consecutive_failures.load(Ordering::Acquire)
    }

    fn stamp_opened(&self) {
        self.state.opened_at_millis.store((self.now_millis)(), Ordering::Release);
    }

    fn refusal(&self) -> CircuitOpen {
        CircuitOpen { consecutive_failures: self.consecutive_failures() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Hand-cranked time: advance by bumping the returned counter.
    fn manual_time(breaker: CircuitBreaker) -> (CircuitBreaker, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(0));
        let ticks = now.clone();
        (breaker.with_time_source(move || ticks.load(Ordering::SeqCst)), now)
    }

    #[test]
    fn starts_closed_and_admits() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.before_call().is_ok());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.before_call().expect("closed");
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.before_call().expect("still closed");
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let refused = breaker.before_call().unwrap_err();
        assert_eq!(refused.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failure_count_in_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_admits_single_trial() {
        let (breaker, now) = manual_time(CircuitBreaker::new(1, Duration::from_millis(100)));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.before_call().is_err());

        now.fetch_add(150, Ordering::SeqCst);

        // First caller after the cooldown wins the trial.
        assert!(breaker.before_call().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Concurrent callers are refused until the trial resolves.
        assert!(breaker.before_call().is_err());
        assert!(breaker.before_call().is_err());
    }

    #[test]
    fn trial_success_closes_circuit() {
        let (breaker, now) = manual_time(CircuitBreaker::new(1, Duration::from_millis(100)));

        breaker.record_failure();
        now.fetch_add(150, Ordering::SeqCst);
        breaker.before_call().expect("trial admitted");
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.before_call().is_ok());
    }

    #[test]
    fn trial_failure_reopens_and_restarts_cooldown() {
        let (breaker, now) = manual_time(CircuitBreaker::new(1, Duration::from_millis(100)));

        breaker.record_failure();
        now.fetch_add(150, Ordering::SeqCst);
        breaker.before_call().expect("trial admitted");
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        // Cooldown restarted at the trial failure, so still refused.
        assert!(breaker.before_call().is_err());

        now.fetch_add(150, Ordering::SeqCst);
        assert!(breaker.before_call().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn reclosed_circuit_allows_new_trial_window() {
        let (breaker, now) = manual_time(CircuitBreaker::new(2, Duration::from_millis(50)));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        now.fetch_add(60, Ordering::SeqCst);
        breaker.before_call().expect("first trial");
        breaker.record_success();

        // A fresh failure cluster must again need the full threshold.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn gauge_encoding_is_stable() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0);
        assert_eq!(CircuitState::Open.as_gauge(), 1);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 2);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
