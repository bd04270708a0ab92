use super::circuit_breaker::{Admission, CircuitBreaker};
use crate::config::{BreakerPolicy, RetryPolicy};
use crate::core::{MutationError, Result, StoreError};
use crate::storage::{MemoryStore, StoreState};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Every store call the engine makes goes through here.
///
/// Store failures (unavailable, lock timeout, snapshot I/O) count against the
/// breaker and are retried with backoff. Errors a closure returns are domain
/// outcomes: the store answered, so they count as successes and pass through.
#[derive(Clone)]
pub struct ResilientStore {
    inner: Arc<MemoryStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ResilientStore {
    pub fn new(inner: Arc<MemoryStore>, breaker: &BreakerPolicy, retry: RetryPolicy) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new("store", breaker)),
            retry,
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn read<R>(
        &self,
        op: &'static str,
        f: impl Fn(&StoreState) -> Result<R>,
    ) -> Result<R> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let admission = self.admit(op)?;
            match self.inner.read(|state| f(state)).await {
                Ok(outcome) => {
                    self.breaker.record_success(admission);
                    return outcome;
                }
                Err(err) => self.after_failure(op, admission, attempt, err).await?,
            }
        }
    }

    /// Run `f` as one atomic store transaction. `f` may run more than once
    /// when the store fails before committing, so it must not have side
    /// effects outside the state it is handed.
    pub async fn transaction<R>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&mut StoreState) -> Result<R>,
    ) -> Result<R> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let admission = self.admit(op)?;
            match self.inner.transaction(|state| f(state)).await {
                Ok(outcome) => {
                    self.breaker.record_success(admission);
                    return outcome;
                }
                Err(err) => self.after_failure(op, admission, attempt, err).await?,
            }
        }
    }

    fn admit(&self, op: &'static str) -> Result<Admission> {
        self.breaker.try_acquire().map_err(|open| {
            debug!(op, retry_after_ms = open.retry_after.as_millis() as u64, "store call rejected");
            MutationError::ServiceUnavailable(format!(
                "store circuit open, retry in {} ms",
                open.retry_after.as_millis()
            ))
        })
    }

    async fn after_failure(
        &self,
        op: &'static str,
        admission: Admission,
        attempt: u32,
        err: StoreError,
    ) -> Result<()> {
        self.breaker.record_failure(admission);
        if attempt >= self.retry.max_attempts.max(1) {
            warn!(op, attempt, error = %err, "store call failed, giving up");
            return Err(err.into());
        }
        let backoff = self.retry.backoff(attempt);
        debug!(op, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying store call");
        sleep(backoff).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorePolicy;
    use crate::resilience::BreakerState;
    use std::time::Duration;

    fn store(threshold: u32, retry: RetryPolicy) -> ResilientStore {
        ResilientStore::new(
            Arc::new(MemoryStore::new(&StorePolicy::default())),
            &BreakerPolicy {
                failure_threshold: threshold,
                cooldown_ms: 60_000,
            },
            retry,
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = store(5, RetryPolicy::default());
        store.inner().inject_failures(2);

        let value = store.read("test", |_| Ok(42)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(store.breaker().snapshot().state, BreakerState::Closed);
        assert_eq!(store.breaker().snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_are_service_unavailable() {
        let store = store(10, RetryPolicy::default());
        store.inner().inject_failures(3);

        let err = store.read("test", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, MutationError::ServiceUnavailable(_)));
        assert_eq!(store.breaker().snapshot().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_touching_the_store() {
        let store = store(2, RetryPolicy::none());
        store.inner().set_offline(true);
        for _ in 0..2 {
            assert!(store.read("test", |_| Ok(())).await.is_err());
        }
        assert_eq!(store.breaker().snapshot().state, BreakerState::Open);

        store.inner().set_offline(false);
        let started = std::time::Instant::now();
        let err = store.read("test", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, MutationError::ServiceUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn domain_errors_count_as_success() {
        let store = store(1, RetryPolicy::none());
        for _ in 0..3 {
            let err = store
                .transaction("test", |_| Err::<(), _>(MutationError::Forbidden))
                .await
                .unwrap_err();
            assert_eq!(err, MutationError::Forbidden);
        }
        assert_eq!(store.breaker().snapshot().state, BreakerState::Closed);
    }
}
