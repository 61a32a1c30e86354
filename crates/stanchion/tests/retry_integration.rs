//! Integration tests for the retry executor
//!
//! Exercises the public API end to end: backoff schedules, terminal states,
//! cancellation, overall timeout, and the default error classification.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stanchion::retry::{
    policies, retry, retry_with_policy, RetryConfig, RetryError, RetryExecutor,
};
use stanchion::{Classify, ErrorClass};
use tokio_util::sync::CancellationToken;

/// Custom error type for testing
#[derive(Debug, Clone)]
struct GatewayError {
    message: String,
    status: Option<u16>,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

impl Classify for GatewayError {
    fn class(&self) -> ErrorClass {
        match self.status {
            Some(status) => ErrorClass::Operational(status),
            None => ErrorClass::Transient,
        }
    }
}

/// Validates recovery from transient failures under exponential backoff.
///
/// # Test Steps
/// 1. Configure 5 attempts with a short exponential schedule
/// 2. Simulate an operation failing its first 3 attempts
/// 3. Allow success on the 4th attempt
/// 4. Confirm exactly 4 invocations and a successful final result
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_recovers_from_transient_failures() {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let attempt_count_clone = Arc::clone(&attempt_count);

    let config = RetryConfig::builder()
        .max_attempts(5)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(100))
        .backoff_factor(2.0)
        .jitter(true)
        .build()
        .expect("Failed to build config");

    let result = retry_with_policy(config, policies::AlwaysRetry, || {
        let count = Arc::clone(&attempt_count_clone);
        async move {
            if count.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(GatewayError { message: "transient failure".to_string(), status: None })
            } else {
                Ok("delivered")
            }
        }
    })
    .await;

    assert_eq!(result.expect("Should succeed"), "delivered");
    assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
}

/// Validates the executor gives up after the attempt cap and preserves the
/// final failure for diagnostics.
///
/// # Test Steps
/// 1. Configure 3 attempts with a tiny fixed schedule
/// 2. Simulate persistent failures
/// 3. Confirm exactly 3 invocations
/// 4. Confirm the terminal error wraps the last underlying failure
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_exhaustion_wraps_last_failure() {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let attempt_count_clone = Arc::clone(&attempt_count);

    let config = RetryConfig::constant(Duration::from_millis(5), 3);

    let result: Result<(), _> = retry_with_policy(config, policies::AlwaysRetry, || {
        let count = Arc::clone(&attempt_count_clone);
        async move {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            Err(GatewayError { message: format!("failure #{n}"), status: None })
        }
    })
    .await;

    match result {
        Err(RetryError::Exhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.message, "failure #3");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
}

/// Validates the default classification: operational errors retry only for
/// the status allow-list.
///
/// # Test Steps
/// 1. Run a 503-classified failure under `ClassifiedRetry`; expect retries
/// 2. Run a 400-classified failure; expect a single attempt and a
///    non-retryable terminal error
#[tokio::test(flavor = "multi_thread")]
async fn test_classification_gates_operational_errors() {
    let config = RetryConfig::constant(Duration::from_millis(2), 3);

    let unavailable = Arc::new(AtomicU32::new(0));
    let unavailable_clone = Arc::clone(&unavailable);
    let result: Result<(), _> =
        retry_with_policy(config.clone(), policies::ClassifiedRetry, || {
            let count = Arc::clone(&unavailable_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError { message: "service unavailable".to_string(), status: Some(503) })
            }
        })
        .await;
    assert!(matches!(result, Err(RetryError::Exhausted { .. })));
    assert_eq!(unavailable.load(Ordering::SeqCst), 3);

    let bad_request = Arc::new(AtomicU32::new(0));
    let bad_request_clone = Arc::clone(&bad_request);
    let result: Result<(), _> = retry_with_policy(config, policies::ClassifiedRetry, || {
        let count = Arc::clone(&bad_request_clone);
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError { message: "bad request".to_string(), status: Some(400) })
        }
    })
    .await;
    assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
    assert_eq!(bad_request.load(Ordering::SeqCst), 1);
}

/// Validates outcome statistics for the exact documented schedule:
/// 3 attempts, 1s base, factor 2, no jitter, failing twice then succeeding
/// records delays [1000ms, 2000ms].
#[tokio::test(start_paused = true)]
async fn test_outcome_records_documented_schedule() {
    let config = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(1000))
        .max_delay(Duration::from_millis(10_000))
        .backoff_factor(2.0)
        .no_jitter()
        .build()
        .expect("Failed to build config");

    let executor = RetryExecutor::new(config, policies::AlwaysRetry);
    let attempt_count = Arc::new(AtomicU32::new(0));
    let attempt_count_clone = Arc::clone(&attempt_count);

    let outcome = executor
        .execute_with_outcome(move || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(outcome.success());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.delays, vec![Duration::from_millis(1000), Duration::from_millis(2000)]);
    assert!(outcome.elapsed >= Duration::from_millis(3000));
}

/// Validates cancellation during the backoff wait surfaces a cancellation
/// error distinct from exhaustion, without further attempts.
#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_aborts_backoff_wait() {
    let token = CancellationToken::new();
    let config = RetryConfig::builder()
        .max_attempts(10)
        .base_delay(Duration::from_secs(30))
        .max_delay(Duration::from_secs(30))
        .no_jitter()
        .cancellation(token.clone())
        .build()
        .expect("Failed to build config");

    let executor = RetryExecutor::new(config, policies::AlwaysRetry);

    let result = executor
        .execute(move || {
            let token = token.clone();
            async move {
                // Simulate an external shutdown arriving while this
                // operation is failing.
                token.cancel();
                Err::<(), _>("failure".to_string())
            }
        })
        .await;

    match result {
        Err(RetryError::Cancelled { attempts }) => assert_eq!(attempts, 1),
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

/// Validates the overall timeout preempts a long retry loop even with
/// attempts remaining, and that the outcome still reports progress.
#[tokio::test(start_paused = true)]
async fn test_overall_timeout_bounds_the_loop() {
    let config = RetryConfig::builder()
        .max_attempts(1000)
        .base_delay(Duration::from_millis(40))
        .max_delay(Duration::from_millis(40))
        .no_jitter()
        .overall_timeout(Duration::from_millis(150))
        .build()
        .expect("Failed to build config");

    let executor = RetryExecutor::new(config, policies::AlwaysRetry);

    let outcome = executor
        .execute_with_outcome(|| async { Err::<(), _>("always fails".to_string()) })
        .await;

    match outcome.result {
        Err(RetryError::TimedOut { limit, .. }) => {
            assert_eq!(limit, Duration::from_millis(150));
        }
        other => panic!("expected TimedOut, got {other:?}"),
    }
    assert!(outcome.attempts >= 1);
    assert!(outcome.attempts < 1000);
    assert!(outcome.last_error.is_some());
}

/// Validates the observation hook fires once per failed attempt with the
/// chosen delay, before the wait.
#[tokio::test(flavor = "multi_thread")]
async fn test_hook_sees_every_retry() {
    let config = RetryConfig::constant(Duration::from_millis(2), 4);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);

    let executor = RetryExecutor::new(config, policies::AlwaysRetry).on_retry(move |attempt| {
        if let Ok(mut guard) = seen_clone.lock() {
            guard.push(attempt.attempt);
        }
    });

    let _ = executor.execute(|| async { Err::<(), _>("failure".to_string()) }).await;

    let seen = seen.lock().expect("hook records");
    assert_eq!(*seen, vec![1, 2, 3]);
}

/// Validates the simplest convenience entry point with the standard preset.
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_convenience_function() {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let attempt_count_clone = Arc::clone(&attempt_count);

    let result = retry(policies::AlwaysRetry, || {
        let count = Arc::clone(&attempt_count_clone);
        async move {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("first attempt fails".to_string())
            } else {
                Ok("success")
            }
        }
    })
    .await;

    assert_eq!(result.expect("Should succeed"), "success");
}
