use crate::core::{EntityId, ProjectId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// `from` cannot finish before `to`. Must stay acyclic.
    Blocking,
    /// A plain "relates to" link. May cycle.
    Informational,
}

/// Directed edge `from_id -> to_id` between two work items of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: EntityId,
    pub project_id: ProjectId,
    pub from_id: EntityId,
    pub to_id: EntityId,
    pub kind: DependencyKind,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}
