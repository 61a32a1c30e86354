//! Stanchion: retry/backoff execution and rate-limit admission policies.
//!
//! Two cooperating policy components, usable independently:
//!
//! - [`retry`]: executes an asynchronous operation under a configurable
//!   retry policy (attempt cap, exponential backoff with jitter, optional
//!   overall timeout, pluggable retryability, cooperative cancellation).
//! - [`rate_limit`]: decides admit/reject per classification key against a
//!   fixed-window quota, backed by a counter store with a fail-open local
//!   fallback.
//!
//! The two components never call each other; request-handling glue composes
//! them: check the rate limit first, and if admitted, wrap calls to
//! unreliable dependencies in a retry executor.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use stanchion::rate_limit::{RateLimitPolicy, RateLimiter};
//! use stanchion::retry::{policies, RetryConfig, RetryExecutor};
//! use stanchion::store::InMemoryCounterStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::in_memory(vec![RateLimitPolicy::new(
//!     "mail",
//!     Duration::from_secs(60),
//!     5,
//! )])?;
//!
//! let decision = limiter.check("mail", "1.2.3.4").await?;
//! if !decision.allowed {
//!     // return 429 with decision.retry_after(...)
//!     return Ok(());
//! }
//!
//! let executor = RetryExecutor::new(RetryConfig::patient(), policies::ClassifiedRetry);
//! executor
//!     .execute(|| async {
//!         // call the unreliable dependency
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod classify;
pub mod clock;
pub mod rate_limit;
pub mod retry;
pub mod store;

// Re-export commonly used types for convenience
// ------------------------------
pub use classify::{Classify, ErrorClass, RETRYABLE_STATUS_CODES};
pub use clock::{Clock, MockClock, SystemClock};
pub use rate_limit::{RateLimitDecision, RateLimitError, RateLimitPolicy, RateLimiter};
pub use retry::{
    policies, retry, retry_with_policy, OnRetry, RetryAttempt, RetryConfig, RetryConfigBuilder,
    RetryDecision, RetryError, RetryExecutor, RetryOutcome, RetryPolicy, RetryResult,
};
pub use store::{CounterSnapshot, CounterStore, InMemoryCounterStore, StoreError};
