use crate::core::{EntityId, MutationError, PermissionLevel, ProjectId, Result, UserId};
use crate::resilience::ResilientStore;
use crate::storage::StoreState;
use tracing::debug;

/// What a request is about, for permission purposes.
///
/// Entity scopes are resolved to their owning project first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Project(ProjectId),
    WorkItem(EntityId),
    Sprint(EntityId),
    Comment(EntityId),
    TimeEntry(EntityId),
    Dependency(EntityId),
    /// Only the caller's own rows; no project membership involved.
    Caller,
}

impl Scope {
    /// The project that owns the scoped entity. Missing or soft-deleted
    /// targets are `NotFound`.
    pub fn resolve(self, state: &StoreState) -> Result<Option<ProjectId>> {
        let project_id = match self {
            Scope::Caller => return Ok(None),
            Scope::Project(id) => state.project(id)?.id,
            Scope::WorkItem(id) => state.live_work_item(id)?.project_id,
            Scope::Sprint(id) => state.sprint(id)?.project_id,
            Scope::Comment(id) => state.live_comment(id)?.project_id,
            Scope::TimeEntry(id) => state.time_entry(id)?.project_id,
            Scope::Dependency(id) => state.dependency(id)?.project_id,
        };
        Ok(Some(project_id))
    }
}

/// Membership-based permission checks.
#[derive(Clone)]
pub struct Authorizer {
    store: ResilientStore,
}

impl Authorizer {
    pub fn new(store: ResilientStore) -> Self {
        Self { store }
    }

    pub async fn check_permission(
        &self,
        actor: UserId,
        project_id: ProjectId,
        required: PermissionLevel,
    ) -> Result<()> {
        self.store
            .read("authorize.project", |state| {
                state.project(project_id)?;
                require_level(state, actor, project_id, required)
            })
            .await
    }

    /// Resolve `scope` and check `actor` holds at least `required` on the
    /// owning project, in one consistent read.
    pub async fn authorize(
        &self,
        actor: UserId,
        scope: Scope,
        required: PermissionLevel,
    ) -> Result<Option<ProjectId>> {
        if scope == Scope::Caller {
            return Ok(None);
        }
        self.store
            .read("authorize", |state| {
                let project_id = scope.resolve(state)?;
                if let Some(project_id) = project_id {
                    require_level(state, actor, project_id, required)?;
                }
                Ok(project_id)
            })
            .await
    }
}

/// Fails with a generic `Forbidden` when `actor` lacks `required` on the project.
pub fn require_level(
    state: &StoreState,
    actor: UserId,
    project_id: ProjectId,
    required: PermissionLevel,
) -> Result<()> {
    match state.membership_level(project_id, actor) {
        Some(level) if level.satisfies(required) => Ok(()),
        held => {
            debug!(
                actor = %actor,
                project = %project_id,
                ?held,
                ?required,
                "permission denied"
            );
            Err(MutationError::Forbidden)
        }
    }
}
