//! Rate limiting.
//!
//! Fixed window per source: the first request opens a window, every request
//! inside it increments the count, and the window restarts once it has been
//! open for the full window length.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, PolicyConfig, Result};

/// Per-source request counter.
#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    started: Instant,
    count: u32,
}

/// Rate limiter - enforces request rate limits per source.
///
/// NOT shared directly - owned by the policy gate behind its own lock.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: HashMap<String, FixedWindow>,
    last_prune: Option<Instant>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: HashMap::new(),
            last_prune: None,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.rate_limit, config.rate_window)
    }

    /// Record a request from `source` and check it against the limit.
    pub fn check(&mut self, source: &str) -> Result<()> {
        self.check_at(source, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    ///
    /// Denied requests still count toward the window. Expired windows of
    /// other sources are swept at most once per window length.
    pub fn check_at(&mut self, source: &str, now: Instant) -> Result<()> {
        match self.last_prune {
            Some(at) if now.saturating_duration_since(at) < self.window => {}
            _ => {
                self.prune(now);
                self.last_prune = Some(now);
            }
        }

        let window = self
            .windows
            .entry(source.to_string())
            .or_insert(FixedWindow {
                started: now,
                count: 0,
            });

        if now.saturating_duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);

        if window.count > self.limit {
            return Err(Error::rate_limited(format!(
                "source '{}' exceeded {} requests per {}ms",
                source,
                self.limit,
                self.window.as_millis()
            )));
        }
        Ok(())
    }

    /// Requests counted in the current window for `source`.
    pub fn current_count(&self, source: &str) -> u32 {
        self.windows.get(source).map_or(0, |w| w.count)
    }

    /// Drop windows that have been idle for a full window length.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
    }

    pub fn tracked_sources(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_101st_request_in_window_denied() {
        let mut limiter = RateLimiter::new(100, Duration::from_secs(1));
        let t0 = Instant::now();

        for i in 0..100 {
            let now = t0 + Duration::from_millis(i * 5);
            assert!(limiter.check_at("client", now).is_ok(), "request {}", i + 1);
        }
        let err = limiter
            .check_at("client", t0 + Duration::from_millis(900))
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded(_)));
        assert_eq!(limiter.current_count("client"), 101);
    }

    #[test]
    fn test_first_request_after_rollover_allowed() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(limiter.check_at("c", t0).is_ok());
        assert!(limiter.check_at("c", t0).is_ok());
        assert!(limiter.check_at("c", t0).is_err());

        let after = t0 + Duration::from_secs(1);
        assert!(limiter.check_at("c", after).is_ok());
        assert_eq!(limiter.current_count("c"), 1);
    }

    #[test]
    fn test_sources_are_independent() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("a", t0).is_err());
        assert!(limiter.check_at("b", t0).is_ok());
    }

    #[test]
    fn test_prune_drops_idle_windows() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        let t0 = Instant::now();
        limiter.check_at("a", t0).unwrap();
        limiter.check_at("b", t0).unwrap();

        limiter.prune(t0 + Duration::from_millis(500));
        assert_eq!(limiter.tracked_sources(), 2);

        limiter.prune(t0 + Duration::from_secs(2));
        assert_eq!(limiter.tracked_sources(), 0);
    }

    #[test]
    fn test_checks_sweep_expired_sources() {
        let mut limiter = RateLimiter::new(10, Duration::from_secs(1));
        let t0 = Instant::now();
        for i in 0..50 {
            limiter.check_at(&format!("client-{i}"), t0).unwrap();
        }
        assert_eq!(limiter.tracked_sources(), 50);

        limiter
            .check_at("late", t0 + Duration::from_millis(1500))
            .unwrap();
        assert_eq!(limiter.tracked_sources(), 1);
        assert_eq!(limiter.current_count("client-0"), 0);
    }
}
