// ============================================================================
// Store tables
// ============================================================================
//
// Persistent `im` collections make a full-state clone O(1), so every
// transaction works on its own copy and commits by swapping it in.

use crate::core::{EntityId, MutationError, PermissionLevel, ProjectId, Result, UserId};
use crate::model::{
    ActivityRecord, Comment, DependencyEdge, IdempotencyRecord, Membership, Project, Sprint,
    TimeEntry, WorkItem,
};
use chrono::{DateTime, Utc};
use im::{HashMap, Vector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub projects: HashMap<ProjectId, Project>,
    pub memberships: HashMap<ProjectId, HashMap<UserId, PermissionLevel>>,
    pub work_items: HashMap<EntityId, WorkItem>,
    pub sprints: HashMap<EntityId, Sprint>,
    pub comments: HashMap<EntityId, Comment>,
    pub time_entries: HashMap<EntityId, TimeEntry>,
    pub dependencies: HashMap<EntityId, DependencyEdge>,
    pub activity: Vector<ActivityRecord>,
    pub idempotency: HashMap<String, IdempotencyRecord>,
}

impl StoreState {
    // ------------------------------------------------------------------
    // Projects and memberships
    // ------------------------------------------------------------------

    pub fn project(&self, id: ProjectId) -> Result<&Project> {
        self.projects
            .get(&id)
            .ok_or_else(|| MutationError::not_found("project", id))
    }

    pub fn membership_level(&self, project_id: ProjectId, user_id: UserId) -> Option<PermissionLevel> {
        self.memberships
            .get(&project_id)
            .and_then(|members| members.get(&user_id))
            .copied()
    }

    pub fn set_membership(&mut self, membership: Membership) {
        self.memberships
            .entry(membership.project_id)
            .or_insert_with(HashMap::new)
            .insert(membership.user_id, membership.level);
    }

    // ------------------------------------------------------------------
    // Work items
    // ------------------------------------------------------------------

    /// A work item that exists and is not soft-deleted.
    pub fn live_work_item(&self, id: EntityId) -> Result<&WorkItem> {
        self.work_items
            .get(&id)
            .filter(|item| item.is_live())
            .ok_or_else(|| MutationError::not_found("work_item", id))
    }

    pub fn live_work_item_mut(&mut self, id: EntityId) -> Result<&mut WorkItem> {
        self.work_items
            .get_mut(&id)
            .filter(|item| item.is_live())
            .ok_or_else(|| MutationError::not_found("work_item", id))
    }

    pub fn children_of(&self, parent_id: EntityId) -> impl Iterator<Item = &WorkItem> {
        self.work_items
            .values()
            .filter(move |item| item.is_live() && item.parent_id == Some(parent_id))
    }

    // ------------------------------------------------------------------
    // Sprints and comments
    // ------------------------------------------------------------------

    pub fn sprint(&self, id: EntityId) -> Result<&Sprint> {
        self.sprints
            .get(&id)
            .ok_or_else(|| MutationError::not_found("sprint", id))
    }

    pub fn sprint_mut(&mut self, id: EntityId) -> Result<&mut Sprint> {
        self.sprints
            .get_mut(&id)
            .ok_or_else(|| MutationError::not_found("sprint", id))
    }

    pub fn live_comment(&self, id: EntityId) -> Result<&Comment> {
        self.comments
            .get(&id)
            .filter(|comment| comment.is_live())
            .ok_or_else(|| MutationError::not_found("comment", id))
    }

    pub fn live_comment_mut(&mut self, id: EntityId) -> Result<&mut Comment> {
        self.comments
            .get_mut(&id)
            .filter(|comment| comment.is_live())
            .ok_or_else(|| MutationError::not_found("comment", id))
    }

    // ------------------------------------------------------------------
    // Timers and dependencies
    // ------------------------------------------------------------------

    pub fn time_entry(&self, id: EntityId) -> Result<&TimeEntry> {
        self.time_entries
            .get(&id)
            .ok_or_else(|| MutationError::not_found("time_entry", id))
    }

    /// The owner's un-ended timer, if any.
    pub fn running_timer(&self, owner_id: UserId) -> Option<&TimeEntry> {
        self.time_entries
            .values()
            .find(|entry| entry.owner_id == owner_id && entry.is_running())
    }

    pub fn dependency(&self, id: EntityId) -> Result<&DependencyEdge> {
        self.dependencies
            .get(&id)
            .ok_or_else(|| MutationError::not_found("dependency", id))
    }

    pub fn edges_touching(&self, item_id: EntityId) -> impl Iterator<Item = &DependencyEdge> {
        self.dependencies
            .values()
            .filter(move |edge| edge.from_id == item_id || edge.to_id == item_id)
    }

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    pub fn append_activity(&mut self, record: ActivityRecord) {
        self.activity.push_back(record);
    }

    pub fn activity_count(&self) -> usize {
        self.activity.len()
    }

    /// Newest-first activity for a project, optionally narrowed to one entity.
    pub fn recent_activity(
        &self,
        project_id: ProjectId,
        entity_id: Option<EntityId>,
        limit: usize,
    ) -> Vec<ActivityRecord> {
        self.activity
            .iter()
            .rev()
            .filter(|record| record.project_id == project_id)
            .filter(|record| entity_id.is_none_or(|id| record.entity_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Idempotency cache
    // ------------------------------------------------------------------

    pub fn idempotency_record(
        &self,
        caller_id: UserId,
        message_id: &str,
    ) -> Option<&IdempotencyRecord> {
        self.idempotency
            .get(&IdempotencyRecord::key_for(caller_id, message_id))
    }

    /// First write wins; a record is never overwritten.
    pub fn put_idempotency_record(&mut self, record: IdempotencyRecord) -> bool {
        let key = record.key();
        if self.idempotency.contains_key(&key) {
            return false;
        }
        self.idempotency.insert(key, record);
        true
    }

    /// Drops records created before `cutoff`. Returns how many went.
    pub fn purge_idempotency_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.idempotency.len();
        self.idempotency.retain(|_, record| record.created_at >= cutoff);
        before - self.idempotency.len()
    }
}
