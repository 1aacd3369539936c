//! Circuit breaker state machine.
//!
//! Prevents hammering a failing adapter by tracking consecutive failures and
//! temporarily rejecting calls to it.
//!
//! - Closed: calls pass; `failure_threshold` consecutive failures open it
//! - Open: calls are rejected until `reset_at`
//! - Half-Open: one trial call; success closes, failure re-opens
//!
//! The breaker takes the clock as an argument so the owner controls time.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::types::ResilienceConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,

    /// Requests are rejected without being attempted.
    Open,

    /// One trial request is testing whether the adapter recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl From<&ResilienceConfig> for BreakerSettings {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

/// Circuit breaker for a single adapter.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,

    /// Set exactly while `Open`.
    reset_at: Option<Instant>,

    /// When the current half-open trial was let through.
    trial_started: Option<Instant>,

    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            reset_at: None,
            trial_started: None,
            settings,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    /// Ask to let one call through at `now`.
    ///
    /// Returns false when the call must fail with `CIRCUIT_OPEN`. An open
    /// breaker whose cooldown has elapsed moves to half-open and admits
    /// this call as the trial.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let due = self.reset_at.map_or(true, |at| now >= at);
                if due {
                    info!(failures = self.failures, "circuit half-open, allowing trial");
                    self.state = CircuitState::HalfOpen;
                    self.reset_at = None;
                    self.trial_started = Some(now);
                }
                due
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back (caller dropped) must not
                // wedge the breaker forever.
                let abandoned = self
                    .trial_started
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.settings.cooldown);
                if abandoned {
                    self.trial_started = Some(now);
                }
                abandoned
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                info!("circuit closed after successful trial");
                self.close();
            }
            // Outcome of an attempt admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.failures >= self.settings.failure_threshold {
                    warn!(failures = self.failures, "circuit opening due to failures");
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit re-opening after failed trial");
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.reset_at = Some(now + self.settings.cooldown);
        self.trial_started = None;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.reset_at = None;
        self.trial_started = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
