use crate::core::{EntityId, ProjectId, UserId};
use crate::engine::concurrency::{StatusMachine, Versioned};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
}

impl StatusMachine for SprintStatus {
    fn can_transition_to(&self, next: &Self) -> bool {
        use SprintStatus::*;
        matches!(
            (self, next),
            (Planned, Active) | (Planned, Cancelled) | (Active, Completed) | (Active, Cancelled)
        )
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: EntityId,
    pub project_id: ProjectId,
    pub name: String,
    pub goal: String,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub status: SprintStatus,
    pub version: u64,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Versioned for Sprint {
    const ENTITY: &'static str = "sprint";

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
