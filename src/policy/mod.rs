//! Policy gate evaluated before routing.
//!
//! Order is fixed: rate limit first, then access control. The gate never
//! looks at the payload; the only state it mutates is the rate limit windows.

mod access;
mod rate_limiter;

pub use access::AccessPolicy;
pub use rate_limiter::RateLimiter;

use std::sync::{Mutex, PoisonError, RwLock};

use crate::envelope::Envelope;
use crate::types::{Error, ErrorCode, PolicyConfig, Result};

/// Why the gate refused an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    RateLimitExceeded(String),
    AccessDenied(String),
}

impl DenyReason {
    pub fn code(&self) -> ErrorCode {
        match self {
            DenyReason::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            DenyReason::AccessDenied(_) => ErrorCode::AccessDenied,
        }
    }
}

impl From<DenyReason> for Error {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::RateLimitExceeded(msg) => Error::RateLimitExceeded(msg),
            DenyReason::AccessDenied(msg) => Error::AccessDenied(msg),
        }
    }
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(DenyReason),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Rate limiting plus per-target access control.
#[derive(Debug)]
pub struct PolicyGate {
    limiter: Mutex<RateLimiter>,
    access: RwLock<AccessPolicy>,
}

impl PolicyGate {
    pub fn new(limiter: RateLimiter, access: AccessPolicy) -> Self {
        Self {
            limiter: Mutex::new(limiter),
            access: RwLock::new(access),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            RateLimiter::from_config(config),
            AccessPolicy::from_rules(&config.access),
        )
    }

    /// Evaluate `envelope` against the rate limit, then the access rules.
    pub fn check(&self, envelope: &Envelope) -> PolicyDecision {
        let limited = self
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(&envelope.source);
        if let Err(e) = limited {
            tracing::debug!(source = %envelope.source, "rate limited");
            return PolicyDecision::Deny(DenyReason::RateLimitExceeded(e.to_string()));
        }

        let allowed = self
            .access
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_access(&envelope.source, &envelope.target);
        if !allowed {
            tracing::debug!(source = %envelope.source, target = %envelope.target, "access denied");
            return PolicyDecision::Deny(DenyReason::AccessDenied(format!(
                "source '{}' may not address '{}'",
                envelope.source, envelope.target
            )));
        }

        PolicyDecision::Allow
    }

    /// [`check`](Self::check) as a `Result`.
    pub fn enforce(&self, envelope: &Envelope) -> Result<()> {
        match self.check(envelope) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => Err(reason.into()),
        }
    }

    /// Replace the allowed sources for `target`.
    pub fn restrict(&self, target: &str, sources: &[String]) {
        self.access
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .restrict(target, sources);
    }

    /// Open `target` to every source again.
    pub fn clear_restriction(&self, target: &str) {
        self.access
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_target(target);
    }
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}
