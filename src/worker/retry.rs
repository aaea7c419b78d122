//! Reconnect policy for the consumer worker.
//!
//! Two pieces cooperate:
//! - `Backoff`: exponential delay between attempts, capped at a maximum
//! - `CircuitBreaker`: after `failure_threshold` consecutive failures the
//!   circuit opens and no attempt is made until `open_for` has elapsed; the
//!   next attempt is a half-open trial that either closes the circuit or
//!   reopens it.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::WorkerSettings;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `initial * 2^n`, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_for: Duration,
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            failure_threshold,
            open_for,
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether an attempt may be made now. While open, returns how long
    /// remains before the half-open trial.
    pub fn allow(&mut self) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(self.open_for);
                if elapsed >= self.open_for {
                    self.state = CircuitState::HalfOpen;
                    info!("circuit breaker half-open, trying broker");
                    Ok(())
                } else {
                    Err(self.open_for - elapsed)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("circuit breaker closed after successful recovery");
        }
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                self.failure_threshold > 0 && self.failures >= self.failure_threshold
            }
            CircuitState::Open => false,
        };
        if trip {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
            warn!(
                failures = self.failures,
                threshold = self.failure_threshold,
                "circuit breaker opened"
            );
        }
    }
}

/// Backoff, breaker and the consecutive-failure count, reset together once a
/// session reaches a declared queue.
#[derive(Debug, Clone)]
pub struct Reconnect {
    pub backoff: Backoff,
    pub breaker: CircuitBreaker,
    pub consecutive_failures: u32,
}

impl Reconnect {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            backoff: Backoff::new(
                Duration::from_millis(settings.initial_backoff_ms),
                Duration::from_millis(settings.max_backoff_ms),
            ),
            breaker: CircuitBreaker::new(
                settings.failure_threshold,
                Duration::from_secs(settings.breaker_open_secs),
            ),
            consecutive_failures: 0,
        }
    }

    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.breaker.record_success();
        self.consecutive_failures = 0;
    }

    /// A healthy session dropped. Neither the give-up count nor the breaker
    /// moves; the next attempt waits the initial backoff.
    pub fn on_lost(&mut self) -> Duration {
        self.backoff.reset();
        self.backoff.next_delay()
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.breaker.record_failure();
        self.backoff.next_delay()
    }
}
