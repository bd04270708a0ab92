//! Replay protection for mutating requests.
//!
//! A response is cached under the caller and the request's `message_id` once
//! the handler has produced it. A repeat of the same `message_id` by the same
//! caller gets that response back verbatim and never reaches a handler again.
//! Another caller reusing the id is a separate attempt.
//!
//! Recent responses sit in an in-process LRU that is filled synchronously, so
//! an immediate retry always hits. Both paths honour the TTL. The durable record is written by a
//! background task which also purges records past their TTL. Durable writes
//! are best-effort: a failure is logged and the mutation still stands.

use crate::config::IdempotencyPolicy;
use crate::core::{ErrorKind, MutationError, Result, UserId};
use crate::dispatch::{MutationResponse, Outcome};
use crate::model::IdempotencyRecord;
use crate::resilience::ResilientStore;
use crate::worker::BackgroundWorker;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{Level, debug, error, event, warn};

type RecentKey = (UserId, String);

#[derive(Clone)]
struct Recent {
    response: MutationResponse,
    created_at: DateTime<Utc>,
}

pub struct IdempotencyGuard {
    store: ResilientStore,
    recent: Mutex<LruCache<RecentKey, Recent>>,
    writes: mpsc::Sender<IdempotencyRecord>,
    ttl: chrono::Duration,
}

impl IdempotencyGuard {
    /// Create the guard and start its writer task.
    pub fn start(policy: &IdempotencyPolicy, store: ResilientStore) -> (Arc<Self>, BackgroundWorker) {
        let capacity = NonZeroUsize::new(policy.recent_capacity).unwrap_or(NonZeroUsize::MIN);
        let (writes, rx) = mpsc::channel(policy.write_queue.max(1));
        let ttl = chrono::Duration::milliseconds(i64::try_from(policy.ttl_ms).unwrap_or(i64::MAX));

        let guard = Arc::new(Self {
            store: store.clone(),
            recent: Mutex::new(LruCache::new(capacity)),
            writes,
            ttl,
        });

        let purge_every = Duration::from_millis(policy.purge_interval_ms.max(10));
        let worker = BackgroundWorker::spawn("idempotency-writer", move |stop_rx| {
            run_writer(store, rx, stop_rx, purge_every, ttl)
        });
        (guard, worker)
    }

    /// Look up a cached response. Absence is not an error.
    ///
    /// A store failure here is reported as `ServiceUnavailable` so the caller
    /// retries instead of the mutation running unguarded.
    pub async fn check(
        &self,
        caller_id: UserId,
        message_id: &str,
    ) -> Result<Option<MutationResponse>> {
        let key = (caller_id, message_id.to_string());
        let now = Utc::now();
        {
            let mut recent = self.lock_recent();
            if let Some(hit) = recent.get(&key).cloned() {
                if !self.is_expired(hit.created_at, now) {
                    return Ok(Some(hit.response));
                }
                recent.pop(&key);
            }
        }

        let record = self
            .store
            .read("idempotency.check", |state| {
                Ok(state.idempotency_record(caller_id, message_id).cloned())
            })
            .await?;
        let Some(record) = record else {
            return Ok(None);
        };
        if self.is_expired(record.created_at, now) {
            debug!(message_id, "cached response expired");
            return Ok(None);
        }

        let response: MutationResponse = serde_json::from_str(&record.serialized_response)
            .map_err(|err| {
                error!(message_id, error = %err, "cached response is unreadable");
                MutationError::Internal(format!("cached response for '{message_id}': {err}"))
            })?;
        self.lock_recent().put(
            key,
            Recent {
                response: response.clone(),
                created_at: record.created_at,
            },
        );
        Ok(Some(response))
    }

    /// Remember `response` for `caller_id` and its message id.
    ///
    /// `ServiceUnavailable` and `Internal` outcomes are not cached: they say
    /// nothing about whether the mutation ran, and the caller must be able to
    /// retry with the same id.
    pub async fn store(&self, caller_id: UserId, response: &MutationResponse) {
        if !is_cacheable(response) {
            return;
        }

        let created_at = Utc::now();
        self.lock_recent().put(
            (caller_id, response.message_id.clone()),
            Recent {
                response: response.clone(),
                created_at,
            },
        );

        let serialized_response = match serde_json::to_string(response) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(message_id = %response.message_id, error = %err, "response not serializable, skipping durable cache");
                return;
            }
        };
        let record = IdempotencyRecord {
            caller_id,
            message_id: response.message_id.clone(),
            serialized_response,
            created_at,
        };

        match self.writes.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) | Err(TrySendError::Closed(record)) => {
                debug!(message_id = %record.message_id, "writer queue unavailable, writing inline");
                write_record(&self.store, record).await;
            }
        }
    }

    /// Number of responses held in the in-process cache.
    pub fn recent_len(&self) -> usize {
        self.lock_recent().len()
    }

    fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(created_at) > self.ttl
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, LruCache<RecentKey, Recent>> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_cacheable(response: &MutationResponse) -> bool {
    match &response.outcome {
        Outcome::Committed(_) => true,
        Outcome::Error(body) => !matches!(
            body.kind,
            ErrorKind::ServiceUnavailable | ErrorKind::Internal
        ),
    }
}

async fn write_record(store: &ResilientStore, record: IdempotencyRecord) {
    let message_id = record.message_id.clone();
    let outcome = store
        .transaction("idempotency.store", |state| {
            Ok(state.put_idempotency_record(record.clone()))
        })
        .await;
    match outcome {
        Ok(true) => event!(Level::DEBUG, message_id = %message_id, "idempotency record stored"),
        Ok(false) => debug!(message_id = %message_id, "idempotency record already present"),
        Err(err) => {
            warn!(message_id = %message_id, error = %err, "idempotency record not stored")
        }
    }
}

async fn run_writer(
    store: ResilientStore,
    mut rx: mpsc::Receiver<IdempotencyRecord>,
    mut stop_rx: tokio::sync::oneshot::Receiver<()>,
    purge_every: Duration,
    ttl: chrono::Duration,
) {
    let first_purge = tokio::time::Instant::now() + purge_every;
    let mut purge = tokio::time::interval_at(first_purge, purge_every);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            record = rx.recv() => match record {
                Some(record) => write_record(&store, record).await,
                None => break,
            },
            _ = purge.tick() => {
                let cutoff = Utc::now() - ttl;
                match store
                    .transaction("idempotency.purge", |state| Ok(state.purge_idempotency_before(cutoff)))
                    .await
                {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "expired idempotency records purged"),
                    Err(err) => warn!(error = %err, "idempotency purge failed"),
                }
            }
        }
    }

    // Flush whatever was queued before the stop signal.
    while let Ok(record) = rx.try_recv() {
        write_record(&store, record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerPolicy, RetryPolicy, StorePolicy};
    use crate::core::MutationError;
    use crate::dispatch::Payload;
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    const ALICE: UserId = Uuid::from_u128(0xa11ce);

    fn resilient() -> ResilientStore {
        ResilientStore::new(
            Arc::new(MemoryStore::new(&StorePolicy::default())),
            &BreakerPolicy::default(),
            RetryPolicy::none(),
        )
    }

    fn removed(message_id: &str) -> MutationResponse {
        MutationResponse::committed(
            message_id,
            Payload::Removed {
                entity_type: crate::core::EntityType::WorkItem,
                id: Uuid::new_v4(),
                version: Some(3),
            },
        )
    }

    #[tokio::test]
    async fn stored_response_is_replayed() {
        let (guard, worker) = IdempotencyGuard::start(&IdempotencyPolicy::default(), resilient());
        assert_eq!(guard.check(ALICE, "m-1").await.unwrap(), None);

        let response = removed("m-1");
        guard.store(ALICE, &response).await;
        assert_eq!(guard.check(ALICE, "m-1").await.unwrap(), Some(response));
        worker.stop().await;
    }

    #[tokio::test]
    async fn durable_record_outlives_the_lru() {
        let store = resilient();
        let policy = IdempotencyPolicy {
            recent_capacity: 1,
            ..IdempotencyPolicy::default()
        };
        let (guard, worker) = IdempotencyGuard::start(&policy, store.clone());

        let first = removed("m-1");
        guard.store(ALICE, &first).await;
        guard.store(ALICE, &removed("m-2")).await;
        worker.stop().await;

        let persisted = store
            .read("test", |state| Ok(state.idempotency.len()))
            .await
            .unwrap();
        assert_eq!(persisted, 2);
        // m-1 was evicted from the LRU and comes back from the store.
        assert_eq!(guard.check(ALICE, "m-1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn unavailable_and_internal_are_not_cached() {
        let (guard, worker) = IdempotencyGuard::start(&IdempotencyPolicy::default(), resilient());
        guard
            .store(ALICE, &MutationResponse::error(
                "m-1",
                &MutationError::ServiceUnavailable("down".into()),
            ))
            .await;
        guard
            .store(ALICE, &MutationResponse::error("m-2", &MutationError::Internal("boom".into())))
            .await;
        guard
            .store(ALICE, &MutationResponse::error("m-3", &MutationError::Forbidden))
            .await;

        assert_eq!(guard.check(ALICE, "m-1").await.unwrap(), None);
        assert_eq!(guard.check(ALICE, "m-2").await.unwrap(), None);
        assert!(guard.check(ALICE, "m-3").await.unwrap().is_some());
        worker.stop().await;
    }

    #[tokio::test]
    async fn store_failure_on_check_is_service_unavailable() {
        let store = resilient();
        let (guard, worker) = IdempotencyGuard::start(&IdempotencyPolicy::default(), store.clone());
        store.inner().set_offline(true);

        let err = guard.check(ALICE, "m-1").await.unwrap_err();
        assert!(matches!(err, MutationError::ServiceUnavailable(_)));
        store.inner().set_offline(false);
        worker.stop().await;
    }

    #[tokio::test]
    async fn replay_is_scoped_to_caller() {
        let store = resilient();
        let policy = IdempotencyPolicy {
            recent_capacity: 1,
            ..IdempotencyPolicy::default()
        };
        let (guard, worker) = IdempotencyGuard::start(&policy, store.clone());
        let response = removed("m-1");
        guard.store(ALICE, &response).await;

        let mallory = Uuid::new_v4();
        assert_eq!(guard.check(mallory, "m-1").await.unwrap(), None);

        // Also a miss once the entry is only in the durable store.
        guard.store(ALICE, &removed("m-2")).await;
        worker.stop().await;
        assert_eq!(guard.check(mallory, "m-1").await.unwrap(), None);
        assert_eq!(guard.check(ALICE, "m-1").await.unwrap(), Some(response));
    }

    #[tokio::test]
    async fn expired_entries_are_not_replayed_from_memory() {
        let policy = IdempotencyPolicy {
            ttl_ms: 50,
            ..IdempotencyPolicy::default()
        };
        let (guard, worker) = IdempotencyGuard::start(&policy, resilient());
        guard.store(ALICE, &removed("m-1")).await;
        assert!(guard.check(ALICE, "m-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(guard.check(ALICE, "m-1").await.unwrap(), None);
        assert_eq!(guard.recent_len(), 0);
        worker.stop().await;
    }
}
