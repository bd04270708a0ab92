use super::{UpdateOutcome, required_text};
use crate::core::{EntityId, EntityType, MutationError, PermissionLevel, Result};
use crate::dispatch::{Handler, HandlerOutput, MutationRequest, Payload, RequestContext, RequestKind};
use crate::engine::ChangeSet;
use crate::engine::concurrency::{Versioned, check_version};
use crate::guard::{Scope, require_level};
use crate::model::comment::MAX_COMMENT_LEN;
use crate::model::{ActivityAction, ActivityRecord, Comment};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddPayload {
    work_item_id: EntityId,
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EditPayload {
    body: String,
}

pub struct AddComment;

#[async_trait]
impl Handler for AddComment {
    fn kind(&self) -> RequestKind {
        RequestKind::AddComment
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: AddPayload = request.parse_payload()?;
        Ok(Scope::WorkItem(payload.work_item_id))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let payload: AddPayload = request.parse_payload()?;
        let body = required_text("body", &payload.body, MAX_COMMENT_LEN)?;
        let project_id = ctx.project()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let comment = ctx
            .store()
            .transaction("add_comment", |state| {
                state.live_work_item(payload.work_item_id)?;
                let comment = Comment {
                    id: Uuid::new_v4(),
                    project_id,
                    work_item_id: payload.work_item_id,
                    author_id: actor,
                    body: body.clone(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                state.comments.insert(comment.id, comment.clone());
                state.append_activity(ActivityRecord::new(
                    project_id,
                    EntityType::Comment,
                    comment.id,
                    ActivityAction::Created,
                    actor,
                    now,
                ));
                Ok(comment)
            })
            .await?;

        Ok(HandlerOutput::committed(project_id, Payload::Comment(comment)))
    }
}

pub struct EditComment;

#[async_trait]
impl Handler for EditComment {
    fn kind(&self) -> RequestKind {
        RequestKind::EditComment
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::Comment(request.require_target()?))
    }

    /// Only the author may edit.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let expected = request.require_expected_version()?;
        let payload: EditPayload = request.parse_payload()?;
        let project_id = ctx.project()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let outcome = ctx
            .store()
            .transaction("edit_comment", |state| {
                let current = state.live_comment(id)?.clone();
                if current.author_id != actor {
                    return Err(MutationError::Forbidden);
                }
                check_version(&current, expected)?;
                let body = required_text("body", &payload.body, MAX_COMMENT_LEN)?;

                let mut changes = ChangeSet::new();
                if !changes.text("body", &current.body, &body) {
                    return Ok(UpdateOutcome::Unchanged(current));
                }

                let mut next = current;
                next.body = body;
                next.bump_version(now);
                state.comments.insert(id, next.clone());
                state.append_activity(
                    ActivityRecord::new(
                        project_id,
                        EntityType::Comment,
                        id,
                        ActivityAction::Updated,
                        actor,
                        now,
                    )
                    .with_changes(changes.into_changes()),
                );
                Ok(UpdateOutcome::Applied(next))
            })
            .await?;

        Ok(outcome.into_output(project_id, Payload::Comment))
    }
}

pub struct DeleteComment;

#[async_trait]
impl Handler for DeleteComment {
    fn kind(&self) -> RequestKind {
        RequestKind::DeleteComment
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::Comment(request.require_target()?))
    }

    /// The author or a project admin may delete.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let expected = request.expected_version;
        let project_id = ctx.project()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let deleted = ctx
            .store()
            .transaction("delete_comment", |state| {
                let current = state.live_comment(id)?.clone();
                if current.author_id != actor {
                    require_level(state, actor, project_id, PermissionLevel::Admin)?;
                }
                if let Some(expected) = expected {
                    check_version(&current, expected)?;
                }

                let mut deleted = current.clone();
                deleted.deleted_at = Some(now);
                deleted.bump_version(now);

                let mut changes = ChangeSet::new();
                changes.value("deleted_at", &current.deleted_at, &deleted.deleted_at);
                state.comments.insert(id, deleted.clone());
                state.append_activity(
                    ActivityRecord::new(
                        project_id,
                        EntityType::Comment,
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
                entity_type: EntityType::Comment,
                id,
                version: Some(deleted.version),
            },
        ))
    }
}
