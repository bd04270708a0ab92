//! Planning entities persisted by the store.

pub mod activity;
pub mod comment;
pub mod dependency;
pub mod project;
pub mod sprint;
pub mod timer;
pub mod work_item;

pub use activity::{ActivityAction, ActivityRecord, FieldChange};
pub use comment::Comment;
pub use dependency::{DependencyEdge, DependencyKind};
pub use project::{Membership, Project};
pub use sprint::{Sprint, SprintStatus};
pub use timer::TimeEntry;
pub use work_item::{Priority, WorkItem, WorkItemStatus};

use crate::core::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached response for a mutating request.
///
/// Records are scoped to the caller that sent the request: the same
/// `message_id` from a different caller is a different attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub caller_id: UserId,
    pub message_id: String,
    pub serialized_response: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Store key for a caller's message id.
    pub fn key_for(caller_id: UserId, message_id: &str) -> String {
        format!("{caller_id}/{message_id}")
    }

    pub fn key(&self) -> String {
        Self::key_for(self.caller_id, &self.message_id)
    }
}
