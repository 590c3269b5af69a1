//! Consumer-side circuit breaker with lock-free atomics.
//!
//! Callers gate with [`CircuitBreaker::can_pass`] before an RPC hop and
//! report the outcome with `on_success` / `on_failure`. State lives in a
//! single atomic; promotions use compare-and-set so two threads cannot
//! both move Open → HalfOpen.

use crate::clock::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed that trip the breaker.
    pub failure_threshold: usize,
    /// How long Open rejects before a HalfOpen trial is allowed.
    pub reset_timeout: Duration,
    /// Trial calls admitted per HalfOpen episode; the same count of
    /// successes closes the breaker.
    pub half_open_quota: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_quota: 3,
        }
    }
}

impl BreakerConfig {
    /// A breaker that never trips.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            reset_timeout: Duration::from_secs(0),
            half_open_quota: usize::MAX,
        }
    }
}

struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    half_open_inflight: AtomicUsize,
    last_failure_millis: AtomicU64,
}

/// Circuit breaker shared across the callers of one downstream service.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerState>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, reset_timeout: Duration, half_open_quota: usize) -> Self {
        Self::with_config(BreakerConfig { failure_threshold, reset_timeout, half_open_quota })
    }

    pub fn with_config(config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                success_count: AtomicUsize::new(0),
                half_open_inflight: AtomicUsize::new(0),
                last_failure_millis: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Whether a call may proceed right now.
    pub fn can_pass(&self) -> bool {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_CLOSED => return true,
                STATE_OPEN => {
                    let last = self.inner.last_failure_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(last);
                    if elapsed < self.config.reset_timeout.as_millis() as u64 {
                        return false;
                    }
                    match self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // Winner is the first trial call.
                            self.inner.success_count.store(0, Ordering::Release);
                            self.inner.half_open_inflight.store(1, Ordering::Release);
                            tracing::info!("circuit breaker → half-open");
                            return true;
                        }
                        // Lost the race; re-evaluate whatever state won.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let prev = self.inner.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if prev >= self.config.half_open_quota {
                        self.inner.half_open_inflight.fetch_sub(1, Ordering::Release);
                        return false;
                    }
                    return true;
                }
                _ => return false,
            }
        }
    }

    pub fn on_success(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.inner.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_quota
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.reset_counters();
                    tracing::info!("circuit breaker → closed");
                }
            }
            STATE_CLOSED => {
                // A success interrupts any failure streak.
                self.inner.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    pub fn on_failure(&self) {
        let failures = self.inner.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner
            .last_failure_millis
            .store(self.clock.now_millis(), Ordering::Release);

        match self.inner.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    tracing::warn!(failures, threshold = self.config.failure_threshold, "circuit breaker → open");
                }
            }
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!("circuit breaker: trial failed → open");
                }
            }
            _ => {}
        }
    }

    fn reset_counters(&self) {
        self.inner.failure_count.store(0, Ordering::Release);
        self.inner.success_count.store(0, Ordering::Release);
        self.inner.half_open_inflight.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;

    fn breaker(threshold: usize, reset_ms: u64, quota: usize) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let b = CircuitBreaker::new(threshold, Duration::from_millis(reset_ms), quota)
            .with_clock(clock.clone());
        (b, clock)
    }

    #[test]
    fn starts_closed_and_passes() {
        let (b, _) = breaker(3, 100, 1);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.can_pass());
    }

    #[test]
    fn opens_after_threshold_failures_and_rejects() {
        let (b, _) = breaker(3, 100, 1);
        for _ in 0..3 {
            assert!(b.can_pass());
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_pass());
    }

    #[test]
    fn success_in_closed_resets_failure_streak() {
        let (b, _) = breaker(3, 100, 1);
        b.on_failure();
        b.on_failure();
        b.on_success();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn reset_timeout_promotes_to_half_open() {
        let (b, clock) = breaker(2, 100, 1);
        b.on_failure();
        b.on_failure();
        assert!(!b.can_pass());

        clock.advance(100);
        assert!(b.can_pass());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_quota_bounds_trial_calls() {
        let (b, clock) = breaker(1, 50, 2);
        b.on_failure();
        clock.advance(50);

        assert!(b.can_pass()); // promotion winner, counts as trial 1
        assert!(b.can_pass()); // trial 2
        assert!(!b.can_pass()); // quota exhausted
    }

    #[test]
    fn quota_successes_close_the_breaker() {
        let (b, clock) = breaker(2, 100, 3);
        b.on_failure();
        b.on_failure();
        clock.advance(100);
        assert!(b.can_pass());

        b.on_success();
        b.on_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.on_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.can_pass());
    }

    #[test]
    fn half_open_failure_reopens() {
        let (b, clock) = breaker(2, 100, 1);
        b.on_failure();
        b.on_failure();
        clock.advance(100);
        assert!(b.can_pass());

        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_pass());

        // A fresh reset window applies from the new failure.
        clock.advance(99);
        assert!(!b.can_pass());
        clock.advance(1);
        assert!(b.can_pass());
    }

    #[test]
    fn concurrent_promotion_admits_exactly_quota() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (b, clock) = breaker(1, 10, 1);
        b.on_failure();
        clock.advance(10);

        let admitted = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = b.clone();
            let admitted = admitted.clone();
            handles.push(std::thread::spawn(move || {
                if b.can_pass() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }
}
