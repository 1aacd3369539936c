//! Resilience wrapper - per-adapter circuit breaking plus bounded retry.
//!
//! The wrapper only ever sees adapter identifiers. How a dispatch reaches the
//! adapter is the [`Dispatcher`]'s business, so transport lifetime and
//! failure policy stay separate.

mod circuit_breaker;

pub use circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::types::{AdapterId, Error, ResilienceConfig, Result};

/// Sends one envelope to one adapter and waits for its result.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, adapter_id: &AdapterId, envelope: &Envelope) -> Result<Value>;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `2^attempt * base_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor)
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
}

/// Circuit breaker map plus retry loop around a [`Dispatcher`].
#[derive(Debug)]
pub struct ResilienceWrapper {
    breakers: Mutex<HashMap<AdapterId, CircuitBreaker>>,
    settings: BreakerSettings,
    retry: RetryPolicy,
}

impl ResilienceWrapper {
    pub fn new(settings: BreakerSettings, retry: RetryPolicy) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            settings,
            retry,
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(BreakerSettings::from(config), RetryPolicy::from(config))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn breakers(&self) -> MutexGuard<'_, HashMap<AdapterId, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, adapter_id: &AdapterId) -> bool {
        let settings = self.settings;
        self.breakers()
            .entry(adapter_id.clone())
            .or_insert_with(|| CircuitBreaker::new(settings))
            .try_acquire(Instant::now())
    }

    fn record(&self, adapter_id: &AdapterId, success: bool) {
        let now = Instant::now();
        let mut breakers = self.breakers();
        let breaker = breakers
            .entry(adapter_id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.settings));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure(now);
        }
    }

    /// Dispatch `envelope` to `adapter_id` under breaker and retry policy.
    ///
    /// With the breaker open this fails with `CIRCUIT_OPEN` before any
    /// attempt. Otherwise up to `max_attempts` attempts run, every outcome
    /// feeds the breaker, and non-retryable errors stop the loop early.
    pub async fn execute(
        &self,
        dispatcher: &dyn Dispatcher,
        adapter_id: &AdapterId,
        envelope: &Envelope,
    ) -> Result<Value> {
        if !self.acquire(adapter_id) {
            tracing::debug!(adapter_id = %adapter_id, "circuit open, rejecting call");
            return Err(Error::circuit_open(format!(
                "adapter '{adapter_id}' is cooling down after repeated failures"
            )));
        }

        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.backoff(attempt - 1);
                tracing::debug!(adapter_id = %adapter_id, attempt, ?delay, "retrying dispatch");
                tokio::time::sleep(delay).await;
            }

            match dispatcher.dispatch(adapter_id, envelope).await {
                Ok(value) => {
                    self.record(adapter_id, true);
                    return Ok(value);
                }
                Err(e) => {
                    self.record(adapter_id, false);
                    tracing::warn!(
                        adapter_id = %adapter_id,
                        trace_id = %envelope.trace_id(),
                        attempt,
                        error = %e,
                        "dispatch attempt failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::internal("dispatch made no attempts")))
    }

    pub fn state(&self, adapter_id: &AdapterId) -> CircuitState {
        self.breakers()
            .get(adapter_id)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Drop the breaker for an adapter that is gone for good.
    pub fn forget(&self, adapter_id: &AdapterId) {
        self.breakers().remove(adapter_id);
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers()
            .iter()
            .map(|(id, cb)| {
                (
                    id.to_string(),
                    BreakerSnapshot {
                        state: cb.state(),
                        failures: cb.failures(),
                    },
                )
            })
            .collect()
    }
}

impl Default for ResilienceWrapper {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Intent;
    use serde_json::json;

    fn adapter() -> AdapterId {
        AdapterId::from_string("py-1").unwrap()
    }

    fn envelope() -> Envelope {
        Envelope::new("cli", "python", Intent::Invoke, json!({}))
    }

    fn single_attempt() -> ResilienceWrapper {
        ResilienceWrapper::new(
            BreakerSettings::default(),
            RetryPolicy {
                max_attempts: 1,
                base_backoff: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(40), Duration::from_millis(100).saturating_mul(u32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_call_rejected_without_dispatch() {
        let wrapper = single_attempt();
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .times(5)
            .returning(|_, _| Err(Error::dispatch_failed("adapter down")));

        for _ in 0..5 {
            let err = wrapper
                .execute(&dispatcher, &adapter(), &envelope())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::DispatchFailed(_)));
        }
        assert_eq!(wrapper.state(&adapter()), CircuitState::Open);

        let err = wrapper
            .execute(&dispatcher, &adapter(), &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
        dispatcher.checkpoint();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_after_cooldown_closes_breaker() {
        let wrapper = single_attempt();
        let mut failing = MockDispatcher::new();
        failing
            .expect_dispatch()
            .times(5)
            .returning(|_, _| Err(Error::timeout("slow")));
        for _ in 0..5 {
            let _ = wrapper.execute(&failing, &adapter(), &envelope()).await;
        }

        tokio::time::advance(Duration::from_secs(10)).await;

        let mut healthy = MockDispatcher::new();
        healthy
            .expect_dispatch()
            .times(1)
            .returning(|_, _| Ok(json!({"status": "ok", "result": 1})));
        let out = wrapper
            .execute(&healthy, &adapter(), &envelope())
            .await
            .unwrap();
        assert_eq!(out["result"], 1);
        assert_eq!(wrapper.state(&adapter()), CircuitState::Closed);
        assert_eq!(wrapper.snapshot()["py-1"].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeeds() {
        let wrapper = ResilienceWrapper::default();
        let mut dispatcher = MockDispatcher::new();
        let mut calls = 0;
        dispatcher.expect_dispatch().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(Error::timeout("no reply"))
            } else {
                Ok(json!("done"))
            }
        });

        let start = Instant::now();
        let out = wrapper
            .execute(&dispatcher, &adapter(), &envelope())
            .await
            .unwrap();
        assert_eq!(out, json!("done"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(610), "{elapsed:?}");
        assert_eq!(wrapper.snapshot()["py-1"].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_last_error() {
        let wrapper = ResilienceWrapper::default();
        let mut dispatcher = MockDispatcher::new();
        let mut calls = 0;
        dispatcher.expect_dispatch().times(3).returning(move |_, _| {
            calls += 1;
            Err(Error::dispatch_failed(format!("attempt {calls}")))
        });

        let err = wrapper
            .execute(&dispatcher, &adapter(), &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DispatchFailed(ref m) if m == "attempt 3"));
        assert_eq!(wrapper.snapshot()["py-1"].failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_loop() {
        let wrapper = ResilienceWrapper::default();
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .times(1)
            .returning(|_, _| Err(Error::protocol("garbled reply")));

        let err = wrapper
            .execute(&dispatcher, &adapter(), &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_independent_per_adapter() {
        let wrapper = single_attempt();
        let other = AdapterId::from_string("py-2").unwrap();
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .withf(|id, _| id.as_str() == "py-1")
            .times(5)
            .returning(|_, _| Err(Error::dispatch_failed("down")));
        dispatcher
            .expect_dispatch()
            .withf(|id, _| id.as_str() == "py-2")
            .times(1)
            .returning(|_, _| Ok(json!(2)));

        for _ in 0..5 {
            let _ = wrapper.execute(&dispatcher, &adapter(), &envelope()).await;
        }
        assert_eq!(wrapper.state(&adapter()), CircuitState::Open);
        assert_eq!(
            wrapper.execute(&dispatcher, &other, &envelope()).await.unwrap(),
            json!(2)
        );

        wrapper.forget(&adapter());
        assert_eq!(wrapper.state(&adapter()), CircuitState::Closed);
    }
}
