use super::{UpdateOutcome, bounded_text, required_text};
use crate::core::{ConflictContext, EntityType, MutationError, PermissionLevel, ProjectId, Result};
use crate::dispatch::{Handler, HandlerOutput, MutationRequest, Payload, RequestContext, RequestKind};
use crate::engine::ChangeSet;
use crate::engine::concurrency::{Versioned, check_version, ensure_not_terminal, ensure_transition};
use crate::guard::Scope;
use crate::model::{ActivityAction, ActivityRecord, Sprint, SprintStatus};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

const MAX_NAME_LEN: usize = 200;
const MAX_GOAL_LEN: usize = 2_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreatePayload {
    project_id: ProjectId,
    name: String,
    #[serde(default)]
    goal: String,
    starts_on: NaiveDate,
    ends_on: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UpdatePayload {
    name: Option<String>,
    goal: Option<String>,
    starts_on: Option<NaiveDate>,
    ends_on: Option<NaiveDate>,
    status: Option<SprintStatus>,
}

fn check_dates(starts_on: NaiveDate, ends_on: NaiveDate) -> Result<()> {
    if ends_on < starts_on {
        return Err(MutationError::validation("ends_on", "ends_on must not precede starts_on"));
    }
    Ok(())
}

pub struct CreateSprint;

#[async_trait]
impl Handler for CreateSprint {
    fn kind(&self) -> RequestKind {
        RequestKind::CreateSprint
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
        let name = required_text("name", &payload.name, MAX_NAME_LEN)?;
        let goal = bounded_text("goal", &payload.goal, MAX_GOAL_LEN)?;
        check_dates(payload.starts_on, payload.ends_on)?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let sprint = ctx
            .store()
            .transaction("create_sprint", |state| {
                let sprint = Sprint {
                    id: Uuid::new_v4(),
                    project_id,
                    name: name.clone(),
                    goal: goal.clone(),
                    starts_on: payload.starts_on,
                    ends_on: payload.ends_on,
                    status: SprintStatus::Planned,
                    version: 1,
                    created_by: actor,
                    created_at: now,
                    updated_at: now,
                };
                state.sprints.insert(sprint.id, sprint.clone());
                state.append_activity(ActivityRecord::new(
                    project_id,
                    EntityType::Sprint,
                    sprint.id,
                    ActivityAction::Created,
                    actor,
                    now,
                ));
                Ok(sprint)
            })
            .await?;

        Ok(HandlerOutput::committed(project_id, Payload::Sprint(sprint)))
    }
}

pub struct UpdateSprint;

#[async_trait]
impl Handler for UpdateSprint {
    fn kind(&self) -> RequestKind {
        RequestKind::UpdateSprint
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::Sprint(request.require_target()?))
    }

    /// Field edits and status transitions. Only one sprint per project may be
    /// active at a time.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let expected = request.require_expected_version()?;
        let patch: UpdatePayload = request.parse_payload()?;
        let project_id = ctx.project()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let outcome = ctx
            .store()
            .transaction("update_sprint", |state| {
                let current = state.sprint(id)?.clone();
                check_version(&current, expected)?;
                ensure_not_terminal(&current, current.status)?;

                let mut next = current.clone();
                let mut changes = ChangeSet::new();

                if let Some(name) = &patch.name {
                    let name = required_text("name", name, MAX_NAME_LEN)?;
                    if changes.text("name", &current.name, &name) {
                        next.name = name;
                    }
                }
                if let Some(goal) = &patch.goal {
                    let goal = bounded_text("goal", goal, MAX_GOAL_LEN)?;
                    if changes.text("goal", &current.goal, &goal) {
                        next.goal = goal;
                    }
                }
                if let Some(starts_on) = patch.starts_on {
                    if changes.value("starts_on", &current.starts_on, &starts_on) {
                        next.starts_on = starts_on;
                    }
                }
                if let Some(ends_on) = patch.ends_on {
                    if changes.value("ends_on", &current.ends_on, &ends_on) {
                        next.ends_on = ends_on;
                    }
                }
                check_dates(next.starts_on, next.ends_on)?;

                if let Some(status) = patch.status {
                    ensure_transition(&current, current.status, status)?;
                    if changes.value("status", &current.status, &status) {
                        if status == SprintStatus::Active {
                            if let Some(active) = state.sprints.values().find(|other| {
                                other.project_id == current.project_id
                                    && other.id != id
                                    && other.status == SprintStatus::Active
                            }) {
                                return Err(MutationError::Conflict {
                                    message: "another sprint is already active".to_string(),
                                    context: ConflictContext::Existing(active.id),
                                });
                            }
                        }
                        next.status = status;
                    }
                }

                if changes.is_empty() {
                    return Ok(UpdateOutcome::Unchanged(current));
                }

                next.bump_version(now);
                state.sprints.insert(id, next.clone());
                state.append_activity(
                    ActivityRecord::new(
                        next.project_id,
                        EntityType::Sprint,
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

        Ok(outcome.into_output(project_id, Payload::Sprint))
    }
}
