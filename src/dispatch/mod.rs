//! Typed requests, responses and the dispatcher that routes between them.

pub mod dispatcher;
pub mod handlers;
pub mod registry;

pub use dispatcher::{Dispatcher, Origin};
pub use registry::{Handler, HandlerRegistry, RequestContext};

use crate::core::{EntityId, EntityType, ErrorBody, MutationError, ProjectId, Result, UserId};
use crate::model::{ActivityRecord, Comment, DependencyEdge, Sprint, TimeEntry, WorkItem};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    CreateWorkItem,
    UpdateWorkItem,
    DeleteWorkItem,
    CreateSprint,
    UpdateSprint,
    AddComment,
    EditComment,
    DeleteComment,
    StartTimer,
    StopTimer,
    LogManualTime,
    AddDependency,
    RemoveDependency,
    GetWorkItem,
    ListWorkItems,
    GetSprint,
    ListComments,
    CurrentTimer,
    ListDependencies,
    ListActivity,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateWorkItem => "create_work_item",
            Self::UpdateWorkItem => "update_work_item",
            Self::DeleteWorkItem => "delete_work_item",
            Self::CreateSprint => "create_sprint",
            Self::UpdateSprint => "update_sprint",
            Self::AddComment => "add_comment",
            Self::EditComment => "edit_comment",
            Self::DeleteComment => "delete_comment",
            Self::StartTimer => "start_timer",
            Self::StopTimer => "stop_timer",
            Self::LogManualTime => "log_manual_time",
            Self::AddDependency => "add_dependency",
            Self::RemoveDependency => "remove_dependency",
            Self::GetWorkItem => "get_work_item",
            Self::ListWorkItems => "list_work_items",
            Self::GetSprint => "get_sprint",
            Self::ListComments => "list_comments",
            Self::CurrentTimer => "current_timer",
            Self::ListDependencies => "list_dependencies",
            Self::ListActivity => "list_activity",
        }
    }

    /// Entity family the request acts on.
    pub fn target_type(self) -> EntityType {
        match self {
            Self::CreateWorkItem
            | Self::UpdateWorkItem
            | Self::DeleteWorkItem
            | Self::GetWorkItem
            | Self::ListWorkItems => EntityType::WorkItem,
            Self::CreateSprint | Self::UpdateSprint | Self::GetSprint => EntityType::Sprint,
            Self::AddComment | Self::EditComment | Self::DeleteComment | Self::ListComments => {
                EntityType::Comment
            }
            Self::StartTimer | Self::StopTimer | Self::LogManualTime | Self::CurrentTimer => {
                EntityType::TimeEntry
            }
            Self::AddDependency | Self::RemoveDependency | Self::ListDependencies => {
                EntityType::Dependency
            }
            Self::ListActivity => EntityType::Activity,
        }
    }

    /// Mutating kinds go through the idempotency guard; reads skip it.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            Self::GetWorkItem
                | Self::ListWorkItems
                | Self::GetSprint
                | Self::ListComments
                | Self::CurrentTimer
                | Self::ListDependencies
                | Self::ListActivity
        )
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request as received from a client. Never modified after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Idempotency key. Reused only when retrying the same logical attempt.
    pub message_id: String,
    pub caller_id: UserId,
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<EntityId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    /// Client clock at send time. Logged, never used for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl MutationRequest {
    pub fn new(kind: RequestKind, caller_id: UserId) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            caller_id,
            kind,
            target_id: None,
            payload: serde_json::Value::Object(Default::default()),
            expected_version: None,
            sent_at: Some(Utc::now()),
        }
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn target(mut self, target_id: EntityId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn target_type(&self) -> EntityType {
        self.kind.target_type()
    }

    pub fn require_target(&self) -> Result<EntityId> {
        self.target_id
            .ok_or_else(|| MutationError::validation("target_id", "target_id is required"))
    }

    pub fn require_expected_version(&self) -> Result<u64> {
        self.expected_version.ok_or_else(|| {
            MutationError::validation("expected_version", "expected_version is required")
        })
    }

    /// Decode the payload into the handler's typed form. `null` reads as `{}`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value)
            .map_err(|err| MutationError::validation("payload", err.to_string()))
    }
}

/// Committed entity snapshot carried by a successful response or broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    WorkItem(WorkItem),
    WorkItems(Vec<WorkItem>),
    Sprint(Sprint),
    Comment(Comment),
    Comments(Vec<Comment>),
    Timer(TimeEntry),
    TimerStarted {
        started: TimeEntry,
        stopped: Option<TimeEntry>,
    },
    CurrentTimer(Option<TimeEntry>),
    Dependency(DependencyEdge),
    Dependencies(Vec<DependencyEdge>),
    Removed {
        entity_type: EntityType,
        id: EntityId,
        version: Option<u64>,
    },
    Activity(Vec<ActivityRecord>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Outcome {
    Committed(Payload),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub message_id: String,
    pub outcome: Outcome,
}

impl MutationResponse {
    pub fn committed(message_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            message_id: message_id.into(),
            outcome: Outcome::Committed(payload),
        }
    }

    pub fn error(message_id: impl Into<String>, err: &MutationError) -> Self {
        Self {
            message_id: message_id.into(),
            outcome: Outcome::Error(ErrorBody::from(err)),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, Outcome::Committed(_))
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.outcome {
            Outcome::Committed(payload) => Some(payload),
            Outcome::Error(_) => None,
        }
    }

    pub fn error_body(&self) -> Option<&ErrorBody> {
        match &self.outcome {
            Outcome::Committed(_) => None,
            Outcome::Error(body) => Some(body),
        }
    }
}

/// A committed change to publish to one project's subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub project_id: ProjectId,
    pub payload: Payload,
}

/// What a handler hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub payload: Payload,
    pub changes: Vec<Change>,
}

impl HandlerOutput {
    /// A result with nothing to broadcast: reads and no-op updates.
    pub fn unchanged(payload: Payload) -> Self {
        Self {
            payload,
            changes: Vec::new(),
        }
    }

    /// A committed change, broadcast to `project_id` as-is.
    pub fn committed(project_id: ProjectId, payload: Payload) -> Self {
        Self {
            changes: vec![Change {
                project_id,
                payload: payload.clone(),
            }],
            payload,
        }
    }

    pub fn also_notify(mut self, project_id: ProjectId, payload: Payload) -> Self {
        self.changes.push(Change {
            project_id,
            payload,
        });
        self
    }
}
