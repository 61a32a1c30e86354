//! Retry execution with exponential backoff, jitter, and cancellation
//!
//! This module provides a generic retry mechanism for any asynchronous
//! operation that might fail transiently. It supports an attempt cap,
//! exponential backoff saturated at a maximum delay, optional jitter, an
//! overall timeout raced against the whole loop, a pluggable retryability
//! policy, an observation hook invoked before each wait, and cooperative
//! cancellation.
//!
//! Exactly one terminal state is surfaced to the caller: the operation's
//! first successful result, [`RetryError::Exhausted`] wrapping the last
//! failure, [`RetryError::NonRetryable`] wrapping a failure the policy
//! declined to retry, [`RetryError::Cancelled`], or [`RetryError::TimedOut`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
// tokio's Instant tracks virtual time when the runtime clock is paused.
use tokio::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Proportion of the computed delay that jitter may add on top.
///
/// Jitter is applied after saturation at `max_delay`, so a jittered delay can
/// exceed `max_delay` by up to this fraction. That is intentional: the cap
/// bounds the deterministic schedule, and the random spread exists to
/// desynchronize retry storms across callers.
pub const JITTER_PROPORTION: f64 = 0.25;

/// Maximum exponent for backoff calculation to keep the f64 math finite
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Errors that can occur during retry operations
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All retry attempts have been exhausted; wraps the final failure
    #[error("all retry attempts exhausted after {attempts} tries")]
    Exhausted {
        /// Total attempts performed
        attempts: u32,
        /// The last underlying error, preserved for diagnostics
        source: E,
    },

    /// The operation failed with an error the policy declined to retry
    #[error("operation failed with non-retryable error")]
    NonRetryable {
        /// The underlying error, preserved for diagnostics
        source: E,
    },

    /// Cancellation was signalled before or during a backoff wait
    #[error("retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// The overall timeout elapsed before the loop reached a terminal state
    #[error("retry timeout of {limit:?} exceeded after {elapsed:?}")]
    TimedOut { limit: Duration, elapsed: Duration },

    /// The retry configuration is invalid
    #[error("invalid retry configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Terminal result of the execution
    pub result: RetryResult<T, E>,
    /// Total operation invocations performed (always <= `max_attempts`)
    pub attempts: u32,
    /// Per-attempt delays chosen, in order (empty on first-attempt success)
    pub delays: Vec<Duration>,
    /// Wall time from first attempt to the terminal state, including waits
    pub elapsed: Duration,
    /// Human-readable rendering of the last error that occurred, if any
    pub last_error: Option<String>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Whether the execution ended in success.
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    /// Total time spent waiting between attempts.
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Determine if the error should be retried and optionally provide a
    /// custom delay
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation with the configured backoff delay
    Retry,
    /// Retry the operation with a custom delay (e.g. honoring Retry-After)
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Immutable configuration for retry behavior
///
/// Built through [`RetryConfig::builder`] or one of the named presets.
/// Each executor owns its configuration; there is no process-wide default.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum total operation invocations (>= 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Saturation cap for the computed delay (>= `base_delay`)
    pub max_delay: Duration,
    /// Multiplier applied per attempt (>= 1.0; 1.0 yields a constant delay)
    pub backoff_factor: f64,
    /// Whether to add a uniform random extra of up to
    /// [`JITTER_PROPORTION`] x delay
    pub jitter: bool,
    /// Optional limit raced against the entire loop, sleeps included
    pub overall_timeout: Option<Duration>,
    /// Optional token checked at loop entry and honored during waits
    pub cancellation: Option<CancellationToken>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Quick preset: 3 attempts, 250ms base, 2s cap, factor 2, jitter.
    ///
    /// For interactive paths where the caller is waiting on the response.
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter: true,
            overall_timeout: None,
            cancellation: None,
        }
    }

    /// Standard preset: 3 attempts, 1s base, 10s cap, factor 2, jitter.
    ///
    /// The general-purpose default for outbound calls.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
            overall_timeout: None,
            cancellation: None,
        }
    }

    /// Aggressive preset: 5 attempts, 200ms base, 5s cap, factor 2, jitter.
    ///
    /// More attempts with shorter waits, for dependencies that recover fast.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
            overall_timeout: None,
            cancellation: None,
        }
    }

    /// Patient preset: 4 attempts, 2s base, 30s cap, factor 2, jitter.
    ///
    /// For background work that can afford long waits (e.g. email gateways).
    pub fn patient() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            overall_timeout: None,
            cancellation: None,
        }
    }

    /// None preset: a single attempt, no delays, no jitter.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: false,
            overall_timeout: None,
            cancellation: None,
        }
    }

    /// Constant-delay ("linear") preset: factor 1 yields the same delay
    /// before every retry.
    pub fn constant(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: false,
            overall_timeout: None,
            cancellation: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RetryError<()>> {
        if self.max_attempts == 0 {
            return Err(RetryError::InvalidConfiguration {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }
        if self.max_delay < self.base_delay {
            return Err(RetryError::InvalidConfiguration {
                message: "max_delay must be at least base_delay".to_string(),
            });
        }
        if self.backoff_factor < 1.0 {
            return Err(RetryError::InvalidConfiguration {
                message: "backoff_factor must be at least 1.0".to_string(),
            });
        }
        Ok(())
    }

    /// Un-jittered delay before the retry following attempt `attempt`
    /// (1-based): `min(max_delay, base_delay * factor^(attempt - 1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let raw = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay for the given attempt with jitter applied.
    ///
    /// Saturation at `max_delay` happens before jitter, so the result may
    /// exceed `max_delay` by up to [`JITTER_PROPORTION`] x delay.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra_max = delay.as_millis() as f64 * JITTER_PROPORTION;
        let extra = rand::thread_rng().gen_range(0.0..=extra_max);
        delay + Duration::from_millis(extra as u64)
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::standard() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = false;
        self
    }

    pub fn overall_timeout(mut self, limit: Duration) -> Self {
        self.config.overall_timeout = Some(limit);
        self
    }

    pub fn unlimited_time(mut self) -> Self {
        self.config.overall_timeout = None;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = Some(token);
        self
    }

    pub fn build(self) -> Result<RetryConfig, RetryError<()>> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Details passed to the observation hook before each wait
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// The attempt (1-based) that just failed
    pub attempt: u32,
    /// The delay chosen before the next attempt
    pub delay: Duration,
    /// Human-readable rendering of the failure
    pub error: String,
}

/// Hook invoked after each failed attempt, before the backoff wait.
///
/// Intended for logging and metrics. A panicking hook aborts the loop, so
/// hooks should be infallible.
pub type OnRetry = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Mutable state shared between the attempt loop and the overall-timeout
/// branch, so a timed-out execution still reports accurate statistics.
#[derive(Debug, Default)]
struct Progress {
    attempts: AtomicU32,
    delays: Mutex<Vec<Duration>>,
    last_error: Mutex<Option<String>>,
}

impl Progress {
    fn record_attempt(&self, attempt: u32) {
        self.attempts.store(attempt, Ordering::SeqCst);
    }

    fn record_error(&self, rendered: String) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(rendered);
        }
    }

    fn record_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.delays.lock() {
            guard.push(delay);
        }
    }

    fn finish<T, E>(&self, result: RetryResult<T, E>, started: Instant) -> RetryOutcome<T, E> {
        RetryOutcome {
            result,
            attempts: self.attempts.load(Ordering::SeqCst),
            delays: self.delays.lock().map(|guard| guard.clone()).unwrap_or_default(),
            elapsed: started.elapsed(),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// The main retry executor
///
/// Owns a [`RetryConfig`] and a [`RetryPolicy`]; executes operations under
/// them. Instances are cheap to construct and hold no global state.
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
    on_retry: Option<OnRetry>,
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy, on_retry: None }
    }

    /// Create with the standard configuration
    pub fn with_policy(policy: P) -> Self {
        Self::new(RetryConfig::standard(), policy)
    }

    /// Attach a hook invoked after each failed attempt, before the wait
    pub fn on_retry(mut self, hook: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Execute an operation with retry logic
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    ///
    /// If `overall_timeout` is configured, the entire loop (sleeps included)
    /// is raced against the deadline; exceeding it yields
    /// [`RetryError::TimedOut`] regardless of remaining attempts.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let progress = Progress::default();
        let started = Instant::now();

        match self.config.overall_timeout {
            Some(limit) => {
                tokio::select! {
                    outcome = self.attempt_loop(operation, &progress, started) => outcome,
                    () = tokio::time::sleep(limit) => {
                        let elapsed = started.elapsed();
                        warn!(?limit, ?elapsed, "retry timeout exceeded");
                        progress.finish(Err(RetryError::TimedOut { limit, elapsed }), started)
                    }
                }
            }
            None => self.attempt_loop(operation, &progress, started).await,
        }
    }

    async fn attempt_loop<F, Fut, T, E>(
        &self,
        mut operation: F,
        progress: &Progress,
        started: Instant,
    ) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 1;

        loop {
            if let Some(token) = &self.config.cancellation {
                if token.is_cancelled() {
                    debug!("cancellation signalled before attempt {attempt}");
                    return progress
                        .finish(Err(RetryError::Cancelled { attempts: attempt - 1 }), started);
                }
            }

            progress.record_attempt(attempt);
            debug!("executing operation (attempt {}/{})", attempt, self.config.max_attempts);

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("operation succeeded after {} retries", attempt - 1);
                    }
                    return progress.finish(Ok(value), started);
                }
                Err(error) => {
                    let rendered = format!("{error:?}");
                    progress.record_error(rendered.clone());

                    if attempt >= self.config.max_attempts {
                        warn!(
                            "all retry attempts exhausted after {} tries, last error: {rendered}",
                            attempt
                        );
                        return progress
                            .finish(Err(RetryError::Exhausted { attempts: attempt, source: error }), started);
                    }

                    let delay = match self.policy.should_retry(&error, attempt) {
                        RetryDecision::Stop => {
                            debug!("policy declined to retry: {rendered}");
                            return progress
                                .finish(Err(RetryError::NonRetryable { source: error }), started);
                        }
                        RetryDecision::Retry => self.config.jittered_delay(attempt),
                        RetryDecision::RetryAfter(custom) => custom,
                    };

                    progress.record_delay(delay);
                    if let Some(hook) = &self.on_retry {
                        hook(&RetryAttempt { attempt, delay, error: rendered.clone() });
                    }
                    warn!("operation failed (attempt {attempt}), retrying after {delay:?}");

                    if !self.wait(delay).await {
                        debug!("cancellation signalled during backoff wait");
                        return progress
                            .finish(Err(RetryError::Cancelled { attempts: attempt }), started);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Sleep for `delay`, honoring cancellation. Returns false if cancelled.
    async fn wait(&self, delay: Duration) -> bool {
        match &self.config.cancellation {
            Some(token) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => true,
                    () = token.cancelled() => false,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

/// Convenience function to create a retry executor and execute an operation
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    let executor = RetryExecutor::new(config, policy);
    executor.execute(operation).await
}

/// Convenience function to retry with the standard configuration
pub async fn retry<F, Fut, T, E, P>(policy: P, operation: F) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    retry_with_policy(RetryConfig::standard(), policy, operation).await
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::{RetryDecision, RetryPolicy};
    use crate::classify::Classify;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }

    /// Default-classification policy for errors implementing [`Classify`]
    ///
    /// Transient infrastructure failures retry; operational failures retry
    /// only for the status allow-list; permanent failures stop.
    #[derive(Debug, Clone)]
    pub struct ClassifiedRetry;

    impl<E: Classify> RetryPolicy<E> for ClassifiedRetry {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if error.is_retryable() {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}
