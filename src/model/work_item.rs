use crate::core::{EntityId, ProjectId, UserId};
use crate::engine::concurrency::{StatusMachine, Versioned};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Todo,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl StatusMachine for WorkItemStatus {
    fn can_transition_to(&self, next: &Self) -> bool {
        use WorkItemStatus::*;
        matches!(
            (self, next),
            (Todo, InProgress)
                | (Todo, Archived)
                | (InProgress, Todo)
                | (InProgress, Blocked)
                | (InProgress, Done)
                | (Blocked, Todo)
                | (Blocked, InProgress)
                | (Done, InProgress)
                | (Done, Archived)
        )
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// A node in a project's work breakdown. Children point at their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: EntityId,
    pub project_id: ProjectId,
    pub parent_id: Option<EntityId>,
    pub sprint_id: Option<EntityId>,
    pub title: String,
    pub description: String,
    pub status: WorkItemStatus,
    pub priority: Priority,
    pub assignee_id: Option<UserId>,
    pub estimate_minutes: Option<u32>,
    pub version: u64,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    #[inline]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

impl Versioned for WorkItem {
    const ENTITY: &'static str = "work_item";

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn bump_version(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}
