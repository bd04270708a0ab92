use crate::core::{EntityId, EntityType, ProjectId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    Updated,
    Deleted,
    TimerStarted,
    TimerStopped,
    TimeLogged,
    DependencyAdded,
    DependencyRemoved,
}

/// One changed field: `{field, old, new}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// Append-only audit row, one per committed mutation that changed something.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub action: ActivityAction,
    pub field_changes: Vec<FieldChange>,
    pub actor_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(
        project_id: ProjectId,
        entity_type: EntityType,
        entity_id: EntityId,
        action: ActivityAction,
        actor_id: UserId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            entity_type,
            entity_id,
            action,
            field_changes: Vec::new(),
            actor_id,
            timestamp,
        }
    }

    pub fn with_changes(mut self, changes: Vec<FieldChange>) -> Self {
        self.field_changes = changes;
        self
    }
}
