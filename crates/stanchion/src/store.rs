//! Counter storage for fixed-window rate limiting
//!
//! The rate limiter needs one primitive from its backing store: an atomic
//! increment-with-expiry. A single call must create the window record if it
//! is missing, roll it over if the window has expired, and increment the
//! count, all without a read-modify-write race between concurrent callers
//! for the same key. Networked backends (e.g. a shared key-value store)
//! implement this as a single round trip; [`InMemoryCounterStore`] provides
//! the single-instance equivalent.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors a counter store backend can report
///
/// Store failures never surface to rate-limit callers; the limiter degrades
/// to its local fallback instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("counter store unavailable: {message}")]
    Unavailable { message: String },

    /// The backend rejected the operation
    #[error("counter store backend error: {message}")]
    Backend { message: String },
}

/// Post-increment view of a window counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Count after this increment (capped at the supplied `cap`)
    pub count: u64,
    /// Epoch milliseconds at which the current window started
    pub window_start_ms: u64,
}

/// Atomic increment-with-expiry against a keyed counter store
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically fetch-or-create the record for `key`, rolling the window
    /// if `now_ms` is past `window_start + window`, then increment and
    /// return the post-increment snapshot.
    ///
    /// The stored count saturates at `cap` so sustained overload cannot grow
    /// a counter unboundedly; the returned count still reflects the
    /// saturated value, which is all the admission decision needs.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        cap: u64,
        now_ms: u64,
    ) -> Result<CounterSnapshot, StoreError>;
}

/// One window counter. Owned exclusively by the store; created on the first
/// request of a window and replaced wholesale when the window expires.
#[derive(Debug, Clone, Copy)]
struct CounterRecord {
    count: u64,
    window_start_ms: u64,
}

/// Process-local counter store
///
/// Backs single-instance deployments and serves as the fail-open fallback
/// when a shared store is unreachable. Per-key atomicity comes from the
/// map's sharded entry lock, which is held only for the non-async mutation.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    records: DashMap<String, CounterRecord>,
}

impl InMemoryCounterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous increment used directly by the limiter's fallback path
    pub fn apply(&self, key: &str, window: Duration, cap: u64, now_ms: u64) -> CounterSnapshot {
        let window_ms = window.as_millis() as u64;
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert(CounterRecord { count: 0, window_start_ms: now_ms });

        if now_ms >= record.window_start_ms.saturating_add(window_ms) {
            record.count = 0;
            record.window_start_ms = now_ms;
        }
        if record.count < cap {
            record.count += 1;
        }

        CounterSnapshot { count: record.count, window_start_ms: record.window_start_ms }
    }

    /// Drop records whose window ended before `now_ms`.
    ///
    /// Expired records are also rolled over lazily on access; this exists so
    /// long-running processes can reclaim memory for keys that went quiet.
    pub fn purge_expired(&self, window: Duration, now_ms: u64) {
        let window_ms = window.as_millis() as u64;
        self.records
            .retain(|_, record| now_ms < record.window_start_ms.saturating_add(window_ms));
    }

    /// Number of live window records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        cap: u64,
        now_ms: u64,
    ) -> Result<CounterSnapshot, StoreError> {
        Ok(self.apply(key, window, cap, now_ms))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const WINDOW: Duration = Duration::from_millis(60_000);

    /// Validates create-then-increment behavior within a single window.
    #[test]
    fn test_apply_increments_within_window() {
        let store = InMemoryCounterStore::new();

        let first = store.apply("k", WINDOW, 10, 1_000);
        assert_eq!(first, CounterSnapshot { count: 1, window_start_ms: 1_000 });

        let second = store.apply("k", WINDOW, 10, 2_000);
        assert_eq!(second, CounterSnapshot { count: 2, window_start_ms: 1_000 });
    }

    /// Validates the window rolls over once its span has elapsed.
    #[test]
    fn test_apply_rolls_expired_window() {
        let store = InMemoryCounterStore::new();

        for now in [0, 10, 20] {
            store.apply("k", WINDOW, 10, now);
        }

        let rolled = store.apply("k", WINDOW, 10, 60_000);
        assert_eq!(rolled, CounterSnapshot { count: 1, window_start_ms: 60_000 });
    }

    /// Validates the stored count saturates at `cap` under sustained
    /// overload.
    #[test]
    fn test_apply_saturates_at_cap() {
        let store = InMemoryCounterStore::new();

        for _ in 0..100 {
            store.apply("k", WINDOW, 6, 0);
        }

        let snapshot = store.apply("k", WINDOW, 6, 1);
        assert_eq!(snapshot.count, 6);
    }

    /// Validates keys are tracked independently.
    #[test]
    fn test_apply_keys_are_independent() {
        let store = InMemoryCounterStore::new();

        store.apply("a", WINDOW, 10, 0);
        store.apply("a", WINDOW, 10, 0);
        let b = store.apply("b", WINDOW, 10, 0);

        assert_eq!(b.count, 1);
        assert_eq!(store.len(), 2);
    }

    /// Validates `purge_expired` reclaims quiet keys and keeps live ones.
    #[test]
    fn test_purge_expired() {
        let store = InMemoryCounterStore::new();

        store.apply("old", WINDOW, 10, 0);
        store.apply("new", WINDOW, 10, 59_999);
        store.purge_expired(WINDOW, 60_000);

        assert_eq!(store.len(), 1);
        let kept = store.apply("new", WINDOW, 10, 60_000);
        assert_eq!(kept.count, 2);
    }

    /// Two concurrent increments for the same key must never observe the
    /// same pre-increment value.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut handles = Vec::new();

        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment("shared", WINDOW, 1_000, 0).await
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            let snapshot = handle.await.expect("task").expect("store");
            counts.push(snapshot.count);
        }
        counts.sort_unstable();
        let expected: Vec<u64> = (1..=32).collect();
        assert_eq!(counts, expected);
    }
}
