use crate::core::{EntityId, ProjectId, UserId};
use crate::engine::concurrency::Versioned;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked span of work. Running timers have no `ended_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: EntityId,
    pub owner_id: UserId,
    pub work_item_id: EntityId,
    pub project_id: ProjectId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub note: String,
    /// Logged after the fact rather than started live.
    pub manual: bool,
    pub version: u64,
}

impl TimeEntry {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Stamps the end time and derived duration.
    pub fn finish(&mut self, ended_at: DateTime<Utc>) {
        // Clock steps backwards would otherwise yield negative spans.
        let ended_at = ended_at.max(self.started_at);
        self.ended_at = Some(ended_at);
        self.duration_seconds = Some((ended_at - self.started_at).num_seconds());
    }
}

impl Versioned for TimeEntry {
    const ENTITY: &'static str = "time_entry";

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn bump_version(&mut self, _now: DateTime<Utc>) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn finish_never_goes_negative() {
        let started = Utc::now();
        let mut entry = TimeEntry {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            work_item_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            started_at: started,
            ended_at: None,
            duration_seconds: None,
            note: String::new(),
            manual: false,
            version: 1,
        };
        entry.finish(started - Duration::seconds(30));
        assert_eq!(entry.duration_seconds, Some(0));
        assert!(!entry.is_running());
    }
}
