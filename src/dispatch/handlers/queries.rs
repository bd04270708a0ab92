//! Read-only handlers. They skip the idempotency guard and broadcast nothing.

use crate::core::{EntityId, PermissionLevel, ProjectId, Result};
use crate::dispatch::{Handler, HandlerOutput, MutationRequest, Payload, RequestContext, RequestKind};
use crate::guard::Scope;
use crate::model::{Comment, DependencyEdge, WorkItem, WorkItemStatus};
use async_trait::async_trait;
use serde::Deserialize;

const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 500;

macro_rules! read_handler {
    ($name:ident, $kind:expr) => {
        pub struct $name;

        impl $name {
            const KIND: RequestKind = $kind;
        }
    };
}

read_handler!(GetWorkItem, RequestKind::GetWorkItem);
read_handler!(ListWorkItems, RequestKind::ListWorkItems);
read_handler!(GetSprint, RequestKind::GetSprint);
read_handler!(ListComments, RequestKind::ListComments);
read_handler!(CurrentTimer, RequestKind::CurrentTimer);
read_handler!(ListDependencies, RequestKind::ListDependencies);
read_handler!(ListActivity, RequestKind::ListActivity);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListWorkItemsPayload {
    project_id: ProjectId,
    #[serde(default)]
    sprint_id: Option<EntityId>,
    #[serde(default)]
    parent_id: Option<EntityId>,
    #[serde(default)]
    status: Option<WorkItemStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListActivityPayload {
    project_id: ProjectId,
    #[serde(default)]
    entity_id: Option<EntityId>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Handler for GetWorkItem {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::WorkItem(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let item = ctx
            .store()
            .read("get_work_item", |state| Ok(state.live_work_item(id)?.clone()))
            .await?;
        Ok(HandlerOutput::unchanged(Payload::WorkItem(item)))
    }
}

#[async_trait]
impl Handler for ListWorkItems {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: ListWorkItemsPayload = request.parse_payload()?;
        Ok(Scope::Project(payload.project_id))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let filter: ListWorkItemsPayload = request.parse_payload()?;
        let items = ctx
            .store()
            .read("list_work_items", |state| {
                let mut items: Vec<WorkItem> = state
                    .work_items
                    .values()
                    .filter(|item| item.is_live() && item.project_id == filter.project_id)
                    .filter(|item| filter.sprint_id.is_none_or(|id| item.sprint_id == Some(id)))
                    .filter(|item| filter.parent_id.is_none_or(|id| item.parent_id == Some(id)))
                    .filter(|item| filter.status.is_none_or(|status| item.status == status))
                    .cloned()
                    .collect();
                items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(items)
            })
            .await?;
        Ok(HandlerOutput::unchanged(Payload::WorkItems(items)))
    }
}

#[async_trait]
impl Handler for GetSprint {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::Sprint(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let sprint = ctx
            .store()
            .read("get_sprint", |state| Ok(state.sprint(id)?.clone()))
            .await?;
        Ok(HandlerOutput::unchanged(Payload::Sprint(sprint)))
    }
}

#[async_trait]
impl Handler for ListComments {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    /// Target is the work item whose comments to list.
    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::WorkItem(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let work_item_id = request.require_target()?;
        let comments = ctx
            .store()
            .read("list_comments", |state| {
                let mut comments: Vec<Comment> = state
                    .comments
                    .values()
                    .filter(|comment| comment.is_live() && comment.work_item_id == work_item_id)
                    .cloned()
                    .collect();
                comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(comments)
            })
            .await?;
        Ok(HandlerOutput::unchanged(Payload::Comments(comments)))
    }
}

#[async_trait]
impl Handler for CurrentTimer {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    fn scope(&self, _request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::Caller)
    }

    async fn handle(&self, ctx: &RequestContext, _request: &MutationRequest) -> Result<HandlerOutput> {
        let owner = ctx.caller_id;
        let running = ctx
            .store()
            .read("current_timer", |state| Ok(state.running_timer(owner).cloned()))
            .await?;
        Ok(HandlerOutput::unchanged(Payload::CurrentTimer(running)))
    }
}

#[async_trait]
impl Handler for ListDependencies {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    /// Target is the work item; both incoming and outgoing edges are listed.
    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::WorkItem(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let item_id = request.require_target()?;
        let edges = ctx
            .store()
            .read("list_dependencies", |state| {
                let mut edges: Vec<DependencyEdge> = state.edges_touching(item_id).cloned().collect();
                edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(edges)
            })
            .await?;
        Ok(HandlerOutput::unchanged(Payload::Dependencies(edges)))
    }
}

#[async_trait]
impl Handler for ListActivity {
    fn kind(&self) -> RequestKind {
        Self::KIND
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: ListActivityPayload = request.parse_payload()?;
        Ok(Scope::Project(payload.project_id))
    }

    /// Newest first.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let payload: ListActivityPayload = request.parse_payload()?;
        let limit = payload
            .limit
            .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
            .clamp(1, MAX_ACTIVITY_LIMIT);
        let records = ctx
            .store()
            .read("list_activity", |state| {
                Ok(state.recent_activity(payload.project_id, payload.entity_id, limit))
            })
            .await?;
        Ok(HandlerOutput::unchanged(Payload::Activity(records)))
    }
}
