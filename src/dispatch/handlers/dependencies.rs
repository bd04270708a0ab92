use crate::core::{EntityId, EntityType, PermissionLevel, Result};
use crate::dispatch::{Handler, HandlerOutput, MutationRequest, Payload, RequestContext, RequestKind};
use crate::engine::ChangeSet;
use crate::engine::dependency::validate_new_edge;
use crate::guard::Scope;
use crate::model::{ActivityAction, ActivityRecord, DependencyEdge, DependencyKind};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

fn default_kind() -> DependencyKind {
    DependencyKind::Blocking
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddPayload {
    from_id: EntityId,
    to_id: EntityId,
    #[serde(default = "default_kind")]
    kind: DependencyKind,
}

pub struct AddDependency;

#[async_trait]
impl Handler for AddDependency {
    fn kind(&self) -> RequestKind {
        RequestKind::AddDependency
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: AddPayload = request.parse_payload()?;
        Ok(Scope::WorkItem(payload.from_id))
    }

    /// Blocking edges must keep the project's dependency graph acyclic.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let payload: AddPayload = request.parse_payload()?;
        let policy = ctx.config().dependencies.clone();
        let actor = ctx.caller_id;
        let now = Utc::now();

        let edge = ctx
            .store()
            .transaction("add_dependency", |state| {
                let project_id = validate_new_edge(state, &policy, payload.from_id, payload.to_id, payload.kind)?;
                let edge = DependencyEdge {
                    id: Uuid::new_v4(),
                    project_id,
                    from_id: payload.from_id,
                    to_id: payload.to_id,
                    kind: payload.kind,
                    created_by: actor,
                    created_at: now,
                };
                let mut changes = ChangeSet::new();
                changes.value("from_id", &None, &Some(edge.from_id));
                changes.value("to_id", &None, &Some(edge.to_id));
                changes.value("kind", &None, &Some(edge.kind));

                state.dependencies.insert(edge.id, edge.clone());
                state.append_activity(
                    ActivityRecord::new(
                        project_id,
                        EntityType::Dependency,
                        edge.id,
                        ActivityAction::DependencyAdded,
                        actor,
                        now,
                    )
                    .with_changes(changes.into_changes()),
                );
                Ok(edge)
            })
            .await?;

        Ok(HandlerOutput::committed(edge.project_id, Payload::Dependency(edge)))
    }
}

pub struct RemoveDependency;

#[async_trait]
impl Handler for RemoveDependency {
    fn kind(&self) -> RequestKind {
        RequestKind::RemoveDependency
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::Dependency(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let actor = ctx.caller_id;
        let now = Utc::now();

        let edge = ctx
            .store()
            .transaction("remove_dependency", |state| {
                let edge = state.dependency(id)?.clone();
                let mut changes = ChangeSet::new();
                changes.value("from_id", &Some(edge.from_id), &None);
                changes.value("to_id", &Some(edge.to_id), &None);

                state.dependencies.remove(&id);
                state.append_activity(
                    ActivityRecord::new(
                        edge.project_id,
                        EntityType::Dependency,
                        edge.id,
                        ActivityAction::DependencyRemoved,
                        actor,
                        now,
                    )
                    .with_changes(changes.into_changes()),
                );
                Ok(edge)
            })
            .await?;

        Ok(HandlerOutput::committed(
            edge.project_id,
            Payload::Removed {
                entity_type: EntityType::Dependency,
                id,
                version: None,
            },
        ))
    }
}
