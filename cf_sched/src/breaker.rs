//! ABOUTME: Per-executor circuit breaker guarding dispatch calls
//! ABOUTME: Admission is decided under the lock; the call runs outside it

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Successes in half-open required to close again
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting a probe call
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker for one executor.
///
/// The admission decision and the state transition it implies are atomic
/// under the inner mutex; the guarded HTTP call itself must run with no
/// lock held, reporting its outcome through `record_success` /
/// `record_failure`.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
            config,
        }
    }

    /// Decide whether a call may proceed. Open circuits whose reset timeout
    /// has elapsed move to half-open and admit the probing call.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.failures = 0;
                    inner.successes = 0;
                    debug!("Circuit breaker half-open, admitting probe call");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful guarded call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    info!("Circuit breaker closed after successful recovery");
                }
            }
            BreakerState::Open => {
                // A success reported for a call admitted just before the
                // circuit opened; ignore.
            }
        }
    }

    /// Record a failed guarded call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(Instant::now());
                    warn!(
                        failures = inner.failures,
                        reset_secs = self.config.reset_timeout.as_secs(),
                        "Circuit breaker opened after consecutive failures"
                    );
                } else {
                    inner.last_failure = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure = Some(Instant::now());
                warn!("Circuit breaker re-opened from half-open");
            }
            BreakerState::Open => {
                inner.last_failure = Some(Instant::now());
            }
        }
    }

    /// Current state, resolving an elapsed open circuit to half-open
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed > self.config.reset_timeout {
                return BreakerState::HalfOpen;
            }
        }
        inner.state
    }

    /// Force the breaker back to closed (executor recovered)
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.last_failure = None;
    }
}

/// One breaker per executor id, created lazily on first dispatch.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get_or_create(&self, executor_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(executor_id) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(executor_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Drop the breaker for an executor that went offline
    pub fn remove(&self, executor_id: &str) {
        if self.breakers.write().unwrap().remove(executor_id).is_some() {
            debug!(executor_id = %executor_id, "Removed circuit breaker");
        }
    }

    /// Close the breaker for an executor that recovered
    pub fn reset(&self, executor_id: &str) {
        if let Some(breaker) = self.breakers.read().unwrap().get(executor_id) {
            breaker.reset();
            debug!(executor_id = %executor_id, "Reset circuit breaker");
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());

        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert!(breaker.try_acquire());
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_breaker_half_open_after_reset_timeout() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(10),
        });

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.try_acquire());

        std::thread::sleep(Duration::from_millis(20));

        // Elapsed reset timeout admits a probe call
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire());

        breaker.record_success();
        assert!(breaker.try_acquire());
        breaker.record_success();

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(10),
        });

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        // Never reached three consecutive failures
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = BreakerRegistry::default();

        let breaker = registry.get_or_create("ex-1");
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!registry.get_or_create("ex-1").try_acquire());

        registry.reset("ex-1");
        assert!(registry.get_or_create("ex-1").try_acquire());

        registry.remove("ex-1");
        // A fresh breaker starts closed
        assert_eq!(registry.get_or_create("ex-1").state(), BreakerState::Closed);
    }
}
