use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cell::{Cell, CellTimestamp, ColumnRange, WriteBatch};
use crate::error::{StoreError, StoreResult};
use crate::traits::CellStore;

/// Bounded retry with jittered exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first (minimum 1).
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based), jittered into `[d/2, d]`.
    fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .initial_backoff_ms
            .saturating_mul(1u64 << retry.saturating_sub(1).min(20));
        let capped = exp.min(self.max_backoff_ms);
        if capped == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
        Duration::from_millis(jittered)
    }
}

/// Decorator adding bounded retry to any [`CellStore`].
///
/// Transient failures ([`StoreError::is_transient`]) are retried up to
/// `max_attempts` in total; the last failure is then reported as
/// [`StoreError::Unavailable`]. Other errors pass through untouched.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: CellStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn call<T>(&self, op: &'static str, mut f: impl FnMut(&S) -> StoreResult<T>) -> StoreResult<T> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f(&self.inner) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(StoreError::Unavailable {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(op, attempt, max_attempts, ?delay, error = %e, "store call failed; retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: CellStore> CellStore for RetryingStore<S> {
    fn get(&self, table: &str, row: &str, column: &str) -> StoreResult<Option<Cell>> {
        self.call("get", |s| s.get(table, row, column))
    }

    fn read_row(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Vec<(String, Cell)>> {
        self.call("read_row", |s| s.read_row(table, row, columns))
    }

    fn first_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        self.call("first_cell", |s| s.first_cell(table, row, columns))
    }

    fn last_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        self.call("last_cell", |s| s.last_cell(table, row, columns))
    }

    fn row_exists(&self, table: &str, row: &str) -> StoreResult<bool> {
        self.call("row_exists", |s| s.row_exists(table, row))
    }

    fn list_rows(&self, table: &str, after: Option<&str>, limit: usize) -> StoreResult<Vec<String>> {
        self.call("list_rows", |s| s.list_rows(table, after, limit))
    }

    fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.call("list_tables", |s| s.list_tables())
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<CellTimestamp> {
        self.call("apply", |s| s.apply(batch.clone()))
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for RetryingStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingStore")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCellStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with an I/O error.
    struct FlakyStore {
        inner: InMemoryCellStore,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryCellStore::new(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn gate(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            Ok(())
        }
    }

    impl CellStore for FlakyStore {
        fn get(&self, table: &str, row: &str, column: &str) -> StoreResult<Option<Cell>> {
            self.gate()?;
            self.inner.get(table, row, column)
        }
        fn read_row(&self, table: &str, row: &str, columns: &ColumnRange) -> StoreResult<Vec<(String, Cell)>> {
            self.gate()?;
            self.inner.read_row(table, row, columns)
        }
        fn row_exists(&self, table: &str, row: &str) -> StoreResult<bool> {
            self.gate()?;
            self.inner.row_exists(table, row)
        }
        fn list_rows(&self, table: &str, after: Option<&str>, limit: usize) -> StoreResult<Vec<String>> {
            self.gate()?;
            self.inner.list_rows(table, after, limit)
        }
        fn list_tables(&self) -> StoreResult<Vec<String>> {
            self.gate()?;
            self.inner.list_tables()
        }
        fn apply(&self, batch: WriteBatch) -> StoreResult<CellTimestamp> {
            self.gate()?;
            self.inner.apply(batch)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, initial_backoff_ms: 1, max_backoff_ms: 2 }
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = RetryingStore::new(FlakyStore::new(2), fast_policy(3));
        let mut batch = WriteBatch::new();
        batch.put("t", "r", "c", "1");
        store.apply(batch).unwrap();
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_value("t", "r", "c").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn exhausted_retries_surface_unavailable() {
        let store = RetryingStore::new(FlakyStore::new(10), fast_policy(3));
        let err = store.get("t", "r", "c").unwrap_err();
        match err {
            StoreError::Unavailable { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn conflicts_are_not_retried() {
        let store = RetryingStore::new(FlakyStore::new(0), fast_policy(5));
        let mut batch = WriteBatch::new();
        batch.expect("t", "r", "c", Some(CellTimestamp::new(1, 0))).put("t", "r", "c", "1");
        assert!(matches!(store.apply(batch), Err(StoreError::Conflict { .. })));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_retry_policy_fails_fast() {
        let store = RetryingStore::new(FlakyStore::new(1), RetryPolicy::none());
        assert!(matches!(
            store.row_exists("t", "r"),
            Err(StoreError::Unavailable { attempts: 1, .. })
        ));
        assert!(!store.row_exists("t", "r").unwrap());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy { max_attempts: 10, initial_backoff_ms: 100, max_backoff_ms: 300 };
        for retry in 1..10 {
            assert!(policy.backoff(retry) <= Duration::from_millis(300));
        }
        assert!(policy.backoff(1) >= Duration::from_millis(50));
        assert_eq!(RetryPolicy::none().backoff(1), Duration::ZERO);
    }
}
