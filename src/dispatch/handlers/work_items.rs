use super::{UpdateOutcome, bounded_text, nullable, required_text};
use crate::core::{
    ConflictContext, EntityId, EntityType, MutationError, PermissionLevel, ProjectId, Result,
    UserId,
};
use crate::dispatch::{HandlerOutput, MutationRequest, Payload, RequestContext, RequestKind, Handler};
use crate::engine::concurrency::{StatusMachine, Versioned, check_version, ensure_not_terminal, ensure_transition};
use crate::engine::{ChangeSet, dependency::check_parent};
use crate::guard::Scope;
use crate::model::work_item::{MAX_DESCRIPTION_LEN, MAX_TITLE_LEN};
use crate::model::{ActivityAction, ActivityRecord, Priority, WorkItem, WorkItemStatus};
use crate::storage::StoreState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreatePayload {
    project_id: ProjectId,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parent_id: Option<EntityId>,
    #[serde(default)]
    sprint_id: Option<EntityId>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    assignee_id: Option<UserId>,
    #[serde(default)]
    estimate_minutes: Option<u32>,
}

/// Fields absent from the payload are left alone; explicit `null` clears.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UpdatePayload {
    title: Option<String>,
    description: Option<String>,
    status: Option<WorkItemStatus>,
    priority: Option<Priority>,
    #[serde(deserialize_with = "nullable")]
    parent_id: Option<Option<EntityId>>,
    #[serde(deserialize_with = "nullable")]
    sprint_id: Option<Option<EntityId>>,
    #[serde(deserialize_with = "nullable")]
    assignee_id: Option<Option<UserId>>,
    #[serde(deserialize_with = "nullable")]
    estimate_minutes: Option<Option<u32>>,
}

pub struct CreateWorkItem;

#[async_trait]
impl Handler for CreateWorkItem {
    fn kind(&self) -> RequestKind {
        RequestKind::CreateWorkItem
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: CreatePayload = request.parse_payload()?;
        Ok(Scope::Project(payload.project_id))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let payload: CreatePayload = request.parse_payload()?;
        let project_id = ctx.project()?;
        let title = required_text("title", &payload.title, MAX_TITLE_LEN)?;
        let description = bounded_text("description", &payload.description, MAX_DESCRIPTION_LEN)?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let item = ctx
            .store()
            .transaction("create_work_item", |state| {
                if let Some(parent_id) = payload.parent_id {
                    if state.live_work_item(parent_id)?.project_id != project_id {
                        return Err(MutationError::validation(
                            "parent_id",
                            "parent must belong to the same project",
                        ));
                    }
                }
                if let Some(sprint_id) = payload.sprint_id {
                    check_sprint(state, sprint_id, project_id)?;
                }
                if let Some(assignee_id) = payload.assignee_id {
                    check_assignee(state, project_id, assignee_id)?;
                }

                let item = WorkItem {
                    id: Uuid::new_v4(),
                    project_id,
                    parent_id: payload.parent_id,
                    sprint_id: payload.sprint_id,
                    title: title.clone(),
                    description: description.clone(),
                    status: WorkItemStatus::Todo,
                    priority: payload.priority,
                    assignee_id: payload.assignee_id,
                    estimate_minutes: payload.estimate_minutes,
                    version: 1,
                    created_by: actor,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                state.work_items.insert(item.id, item.clone());
                state.append_activity(ActivityRecord::new(
                    project_id,
                    EntityType::WorkItem,
                    item.id,
                    ActivityAction::Created,
                    actor,
                    now,
                ));
                Ok(item)
            })
            .await?;

        Ok(HandlerOutput::committed(project_id, Payload::WorkItem(item)))
    }
}

pub struct UpdateWorkItem;

#[async_trait]
impl Handler for UpdateWorkItem {
    fn kind(&self) -> RequestKind {
        RequestKind::UpdateWorkItem
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::WorkItem(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let expected = request.require_expected_version()?;
        let patch: UpdatePayload = request.parse_payload()?;
        let project_id = ctx.project()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let outcome = ctx
            .store()
            .transaction("update_work_item", |state| {
                apply_update(state, id, expected, &patch, actor, now)
            })
            .await?;
        Ok(outcome.into_output(project_id, Payload::WorkItem))
    }
}

fn apply_update(
    state: &mut StoreState,
    id: EntityId,
    expected: u64,
    patch: &UpdatePayload,
    actor: UserId,
    now: DateTime<Utc>,
) -> Result<UpdateOutcome<WorkItem>> {
    let current = state.live_work_item(id)?.clone();
    check_version(&current, expected)?;
    ensure_not_terminal(&current, current.status)?;

    let mut next = current.clone();
    let mut changes = ChangeSet::new();

    if let Some(title) = &patch.title {
        let title = required_text("title", title, MAX_TITLE_LEN)?;
        if changes.text("title", &current.title, &title) {
            next.title = title;
        }
    }
    if let Some(description) = &patch.description {
        let description = bounded_text("description", description, MAX_DESCRIPTION_LEN)?;
        if changes.text("description", &current.description, &description) {
            next.description = description;
        }
    }
    if let Some(status) = patch.status {
        ensure_transition(&current, current.status, status)?;
        if changes.value("status", &current.status, &status) {
            next.status = status;
        }
    }
    if let Some(priority) = patch.priority {
        if changes.value("priority", &current.priority, &priority) {
            next.priority = priority;
        }
    }
    if let Some(parent_id) = patch.parent_id {
        if changes.value("parent_id", &current.parent_id, &parent_id) {
            if let Some(parent_id) = parent_id {
                check_parent(state, id, parent_id)?;
            }
            next.parent_id = parent_id;
        }
    }
    if let Some(sprint_id) = patch.sprint_id {
        if changes.value("sprint_id", &current.sprint_id, &sprint_id) {
            if let Some(sprint_id) = sprint_id {
                check_sprint(state, sprint_id, current.project_id)?;
            }
            next.sprint_id = sprint_id;
        }
    }
    if let Some(assignee_id) = patch.assignee_id {
        if changes.value("assignee_id", &current.assignee_id, &assignee_id) {
            if let Some(assignee_id) = assignee_id {
                check_assignee(state, current.project_id, assignee_id)?;
            }
            next.assignee_id = assignee_id;
        }
    }
    if let Some(estimate) = patch.estimate_minutes {
        if changes.value("estimate_minutes", &current.estimate_minutes, &estimate) {
            next.estimate_minutes = estimate;
        }
    }

    if changes.is_empty() {
        return Ok(UpdateOutcome::Unchanged(current));
    }

    next.bump_version(now);
    state.work_items.insert(id, next.clone());
    state.append_activity(
        ActivityRecord::new(
            next.project_id,
            EntityType::WorkItem,
            id,
            ActivityAction::Updated,
            actor,
            now,
        )
        .with_changes(changes.into_changes()),
    );
    Ok(UpdateOutcome::Applied(next))
}

pub struct DeleteWorkItem;

#[async_trait]
impl Handler for DeleteWorkItem {
    fn kind(&self) -> RequestKind {
        RequestKind::DeleteWorkItem
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::WorkItem(request.require_target()?))
    }

    /// Soft-deletes the item and drops every dependency edge touching it.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let expected = request.expected_version;
        let project_id = ctx.project()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let deleted = ctx
            .store()
            .transaction("delete_work_item", |state| {
                let current = state.live_work_item(id)?.clone();
                if let Some(expected) = expected {
                    check_version(&current, expected)?;
                }
                if let Some(child_id) = state.children_of(id).map(|child| child.id).next() {
                    return Err(MutationError::Conflict {
                        message: "work item still has live children".to_string(),
                        context: ConflictContext::Existing(child_id),
                    });
                }

                let edge_ids: Vec<EntityId> = state.edges_touching(id).map(|edge| edge.id).collect();
                for edge_id in &edge_ids {
                    state.dependencies.remove(edge_id);
                }

                let mut deleted = current.clone();
                deleted.deleted_at = Some(now);
                deleted.bump_version(now);

                let mut changes = ChangeSet::new();
                changes.value("deleted_at", &current.deleted_at, &deleted.deleted_at);
                if !edge_ids.is_empty() {
                    changes.value("dependencies", &edge_ids, &Vec::<EntityId>::new());
                }

                state.work_items.insert(id, deleted.clone());
                state.append_activity(
                    ActivityRecord::new(
                        project_id,
                        EntityType::WorkItem,
                        id,
                        ActivityAction::Deleted,
                        actor,
                        now,
                    )
                    .with_changes(changes.into_changes()),
                );
                Ok(deleted)
            })
            .await?;

        Ok(HandlerOutput::committed(
            project_id,
            Payload::Removed {
                entity_type: EntityType::WorkItem,
                id,
                version: Some(deleted.version),
            },
        ))
    }
}

/// A sprint of `project_id` that is still open for planning.
pub(crate) fn check_sprint(state: &StoreState, sprint_id: EntityId, project_id: ProjectId) -> Result<()> {
    let sprint = state.sprint(sprint_id)?;
    if sprint.project_id != project_id {
        return Err(MutationError::validation(
            "sprint_id",
            "sprint must belong to the same project",
        ));
    }
    if sprint.status.is_terminal() {
        return Err(MutationError::validation(
            "sprint_id",
            format!("sprint is {}", sprint.status.label()),
        ));
    }
    Ok(())
}

fn check_assignee(state: &StoreState, project_id: ProjectId, assignee_id: UserId) -> Result<()> {
    if state.membership_level(project_id, assignee_id).is_none() {
        return Err(MutationError::validation(
            "assignee_id",
            "assignee is not a member of the project",
        ));
    }
    Ok(())
}
