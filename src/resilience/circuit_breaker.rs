//! Circuit Breaker
//!
//! Stops routing calls to an unhealthy remote. Closed counts failures inside
//! a rolling window; at the threshold it opens. After the reset timeout a
//! single trial call decides between closing again and reopening.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::error::{CoreError, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// One trial request decides what happens next
    HalfOpen,
    /// Blocking all requests
    Open,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before the half-open trial
    pub reset_timeout: Duration,
    /// Time window for counting failures
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Breaker snapshot for health output
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub times_opened: u64,
    pub rejected: u64,
}

struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
    rejected: u64,
}

/// Circuit breaker for preventing cascade failures
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: &str) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create with custom config
    pub fn with_config(name: &str, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, clock::system())
    }

    pub fn with_clock(name: &str, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.to_string(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                times_opened: 0,
                rejected: 0,
            }),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Returns `CircuitOpen` without invoking `op` while open, or while the
    /// half-open trial is still running. Only errors for which
    /// [`CoreError::trips_breaker`] holds count as failures.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let outcome = op().await;
        match &outcome {
            Err(e) if e.trips_breaker() => permit.failure(),
            _ => permit.success(),
        }
        outcome
    }

    /// Admit one call, or reject it with `CircuitOpen`
    pub fn acquire(&self) -> Result<Permit<'_>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(self.config.reset_timeout, |at| now.saturating_duration_since(at));
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("Circuit breaker '{}' half-open, admitting trial", self.name);
                    Ok(Permit::new(self, true))
                } else {
                    inner.rejected += 1;
                    Err(CoreError::CircuitOpen {
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    Err(CoreError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!("Circuit breaker '{}' closed after recovery", self.name);
            }
            CircuitState::Closed => inner.failures.clear(),
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                inner.times_opened += 1;
                warn!("Circuit breaker '{}' reopened after failed trial", self.name);
            }
            CircuitState::Closed => {
                let window = self.config.failure_window;
                inner.failures.push_back(now);
                while let Some(first) = inner.failures.front() {
                    if now.saturating_duration_since(*first) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }

                let count = inner.failures.len() as u32;
                if count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.times_opened += 1;
                    warn!("Circuit breaker '{}' opened after {} failures", self.name, count);
                } else {
                    debug!(
                        "Circuit breaker '{}' failure {}/{}",
                        self.name, count, self.config.failure_threshold
                    );
                }
            }
            _ => {}
        }
    }

    /// Current state. An open breaker whose reset timeout has passed reports
    /// half-open; the transition itself happens on the next call.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at))
                if self.clock.now().saturating_duration_since(at) >= self.config.reset_timeout =>
            {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Failures counted in the current window
    pub fn failure_count(&self) -> usize {
        let now = self.clock.now();
        let inner = self.inner.lock();
        inner
            .failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= self.config.failure_window)
            .count()
    }

    pub fn stats(&self) -> CircuitStats {
        let state = self.state();
        let failures_in_window = self.failure_count();
        let inner = self.inner.lock();
        CircuitStats {
            state,
            failures_in_window,
            times_opened: inner.times_opened,
            rejected: inner.rejected,
        }
    }
}

/// Admission for one call. Dropping an unsettled trial counts as a failure.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            debug!("Circuit breaker '{}' trial abandoned", self.breaker.name);
            self.breaker.record_failure(true);
        }
    }
}
