use super::persistence::{encode_snapshot, load_snapshot, write_snapshot_bytes};
use super::state::StoreState;
use crate::config::StorePolicy;
use crate::core::{MutationError, PermissionLevel, ProjectId, StoreError, StoreResult, UserId};
use crate::model::{Membership, Project};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};

/// Transactional store holding every persisted row.
///
/// Reads share the lock. A transaction takes the write lock, runs its closure
/// against a copy of the state and swaps the copy in only when the closure
/// succeeds (and, with a snapshot path configured, once the snapshot is on
/// disk). Concurrent writers therefore serialize here and nothing a failed
/// closure did is ever visible.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
    lock_timeout: Duration,
    faults: FaultInjector,
    commits: AtomicU64,
}

impl MemoryStore {
    /// An empty store. The snapshot path in `policy` is written but not read.
    pub fn new(policy: &StorePolicy) -> Self {
        Self::with_state(StoreState::default(), policy)
    }

    /// Open the store, loading the snapshot when one exists.
    pub async fn open(policy: &StorePolicy) -> StoreResult<Self> {
        let state = match &policy.snapshot_path {
            Some(path) => {
                let loaded = load_snapshot(path).await?;
                if loaded.is_some() {
                    info!(path = %path.display(), "store snapshot loaded");
                }
                loaded.unwrap_or_default()
            }
            None => StoreState::default(),
        };
        Ok(Self::with_state(state, policy))
    }

    pub fn with_state(state: StoreState, policy: &StorePolicy) -> Self {
        Self {
            state: RwLock::new(state),
            snapshot_path: policy.snapshot_path.clone(),
            lock_timeout: Duration::from_millis(policy.lock_timeout_ms.max(1)),
            faults: FaultInjector::default(),
            commits: AtomicU64::new(0),
        }
    }

    /// Run `f` against a consistent view of the state.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> StoreResult<R> {
        self.faults.check()?;
        let guard = timeout(self.lock_timeout, self.state.read())
            .await
            .map_err(|_| StoreError::Timeout(self.lock_timeout))?;
        Ok(f(&guard))
    }

    /// Run `f` as one atomic transaction.
    ///
    /// The outer `Result` reports store failures; the inner one is whatever
    /// `f` decided. An inner `Err` rolls the transaction back.
    pub async fn transaction<R, E>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<R, E>,
    ) -> StoreResult<Result<R, E>> {
        self.faults.check()?;
        let mut guard = timeout(self.lock_timeout, self.state.write())
            .await
            .map_err(|_| StoreError::Timeout(self.lock_timeout))?;

        let mut working = guard.clone();
        let value = match f(&mut working) {
            Ok(value) => value,
            Err(err) => return Ok(Err(err)),
        };

        if let Some(path) = &self.snapshot_path {
            let bytes = encode_snapshot(&working)?;
            write_snapshot_bytes(path, bytes).await?;
        }

        *guard = working;
        let seq = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(seq, "store transaction committed");
        Ok(Ok(value))
    }

    /// Number of committed transactions since open.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Write the current state to the snapshot path, if one is configured.
    pub async fn checkpoint(&self) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = {
            let guard = self.state.read().await;
            encode_snapshot(&guard)?
        };
        write_snapshot_bytes(path, bytes).await
    }

    // ------------------------------------------------------------------
    // Seeding of the external membership table
    // ------------------------------------------------------------------

    /// Create a project and make `owner` its admin.
    pub async fn seed_project(&self, name: &str, owner: UserId) -> StoreResult<Project> {
        let project = Project::new(name, Utc::now());
        let created = project.clone();
        self.transaction(move |state| {
            state.set_membership(Membership {
                project_id: project.id,
                user_id: owner,
                level: PermissionLevel::Admin,
            });
            state.projects.insert(project.id, project);
            Ok::<_, StoreError>(())
        })
        .await??;
        Ok(created)
    }

    pub async fn grant(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        level: PermissionLevel,
    ) -> crate::core::Result<()> {
        self.transaction(move |state| {
            state.project(project_id)?;
            state.set_membership(Membership {
                project_id,
                user_id,
                level,
            });
            Ok::<_, MutationError>(())
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Make the next `count` calls fail as if the backing store were down.
    pub fn inject_failures(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every call until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FaultInjector {
    fail_next: AtomicU32,
    offline: AtomicBool,
}

impl FaultInjector {
    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        let took = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if took.is_ok() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}
