//! Fixed-window rate-limit admission decisions
//!
//! Given a category (which selects a [`RateLimitPolicy`]) and a client
//! identifier, [`RateLimiter::check`] decides admit/reject for the current
//! request and reports the remaining quota and the window reset time. The
//! counter lives in a shared [`CounterStore`]; if that store is unreachable
//! the limiter fails open, deciding from a process-local counter with the
//! same semantics and flagging the decision as not durable. Blocking all
//! traffic on a limiter outage would be worse than under-enforcing limits,
//! so store failures never surface to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::{CounterStore, InMemoryCounterStore};

/// Errors the rate limiter can return to callers
///
/// Store unavailability is deliberately absent: it degrades the decision
/// instead of failing it.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// No policy is registered for the requested category
    #[error("no rate limit policy registered for category '{category}'")]
    UnknownCategory { category: String },

    /// A policy failed validation
    #[error("invalid rate limit policy: {message}")]
    InvalidPolicy { message: String },
}

/// Quota policy for one request category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Category name this policy applies to (e.g. "login", "contact-form")
    pub category: String,
    /// Fixed window span
    pub window: Duration,
    /// Requests admitted per window per identifier
    pub max_requests: u64,
}

impl RateLimitPolicy {
    /// Create a policy for a category
    pub fn new(category: impl Into<String>, window: Duration, max_requests: u64) -> Self {
        Self { category: category.into(), window, max_requests }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.category.is_empty() {
            return Err(RateLimitError::InvalidPolicy {
                message: "category must not be empty".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(RateLimitError::InvalidPolicy {
                message: "window must be greater than zero".to_string(),
            });
        }
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidPolicy {
                message: "max_requests must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Quota left in the current window (0 when rejected)
    pub remaining: u64,
    /// Epoch milliseconds at which the current window resets
    pub reset_at_epoch_ms: u64,
    /// True when the shared store served the decision; false when the
    /// process-local fallback did (the count may under-represent traffic
    /// across instances)
    pub durable: bool,
}

impl RateLimitDecision {
    /// How long the caller should wait before retrying, measured from
    /// `now_ms`. Zero if the window has already reset.
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_at_epoch_ms.saturating_sub(now_ms))
    }
}

/// Fixed-window rate limiter backed by a shared counter store
///
/// Each instance owns its policy table; there is no process-wide
/// configuration. The store is consulted with a single atomic
/// increment-with-expiry per check, so concurrent requests for the same key
/// can never both observe the same pre-increment count.
pub struct RateLimiter<C: Clock = SystemClock> {
    policies: HashMap<String, RateLimitPolicy>,
    store: Arc<dyn CounterStore>,
    fallback: InMemoryCounterStore,
    clock: C,
}

impl RateLimiter<SystemClock> {
    /// Create a limiter over the given store with the system clock
    pub fn new(
        policies: Vec<RateLimitPolicy>,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self, RateLimitError> {
        Self::with_clock(policies, store, SystemClock)
    }

    /// Create a limiter with its own in-memory store, for single-instance
    /// deployments
    pub fn in_memory(policies: Vec<RateLimitPolicy>) -> Result<Self, RateLimitError> {
        Self::new(policies, Arc::new(InMemoryCounterStore::new()))
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter with a custom clock
    pub fn with_clock(
        policies: Vec<RateLimitPolicy>,
        store: Arc<dyn CounterStore>,
        clock: C,
    ) -> Result<Self, RateLimitError> {
        let mut table = HashMap::with_capacity(policies.len());
        for policy in policies {
            policy.validate()?;
            if table.insert(policy.category.clone(), policy).is_some() {
                return Err(RateLimitError::InvalidPolicy {
                    message: "duplicate category".to_string(),
                });
            }
        }
        Ok(Self { policies: table, store, fallback: InMemoryCounterStore::new(), clock })
    }

    /// Decide admit/reject for `identifier` under the category's policy.
    ///
    /// Returns an error only for an unregistered category; store failures
    /// degrade to the local fallback instead.
    pub async fn check(
        &self,
        category: &str,
        identifier: &str,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let policy = self.policies.get(category).ok_or_else(|| {
            RateLimitError::UnknownCategory { category: category.to_string() }
        })?;
        let key = format!("{category}:{identifier}");
        Ok(self.decide(policy.window, policy.max_requests, &key).await)
    }

    /// Decide admit/reject under caller-supplied limits instead of the
    /// category's registered policy.
    ///
    /// Each (window, max) combination is namespaced into its own counter,
    /// disjoint from other combinations and from the default policy's
    /// counters.
    pub async fn check_with_limits(
        &self,
        category: &str,
        identifier: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let probe = RateLimitPolicy::new(category, window, max_requests);
        probe.validate()?;
        let key = format!("{category}:{}:{max_requests}:{identifier}", window.as_millis());
        Ok(self.decide(window, max_requests, &key).await)
    }

    async fn decide(&self, window: Duration, max_requests: u64, key: &str) -> RateLimitDecision {
        let now_ms = self.clock.millis_since_epoch();
        // The rejected request may still be recorded, but the stored count
        // saturates at max + 1 so sustained overload stays bounded.
        let cap = max_requests.saturating_add(1);

        let (snapshot, durable) = match self.store.increment(key, window, cap, now_ms).await {
            Ok(snapshot) => (snapshot, true),
            Err(error) => {
                warn!(key, %error, "counter store unavailable, deciding from local fallback");
                (self.fallback.apply(key, window, cap, now_ms), false)
            }
        };

        let window_ms = window.as_millis() as u64;
        let reset_at_epoch_ms = snapshot.window_start_ms.saturating_add(window_ms);

        if snapshot.count <= max_requests {
            let remaining = max_requests - snapshot.count;
            debug!(key, count = snapshot.count, remaining, "request admitted");
            RateLimitDecision { allowed: true, remaining, reset_at_epoch_ms, durable }
        } else {
            debug!(key, reset_at_epoch_ms, "rate limit exceeded");
            RateLimitDecision { allowed: false, remaining: 0, reset_at_epoch_ms, durable }
        }
    }
}
