use crate::core::{EntityId, ProjectId, UserId};
use crate::engine::concurrency::Versioned;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_COMMENT_LEN: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: EntityId,
    pub project_id: ProjectId,
    pub work_item_id: EntityId,
    pub author_id: UserId,
    pub body: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Comment {
    #[inline]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

impl Versioned for Comment {
    const ENTITY: &'static str = "comment";

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
