//! "One running timer per owner".
//!
//! These functions run inside a store transaction, so stopping the previous
//! timer and starting the next one commit together or not at all.

use super::change_tracker::ChangeSet;
use super::concurrency::{Versioned, check_version};
use crate::config::TimerPolicy;
use crate::core::{EntityId, EntityType, MutationError, Result, UserId};
use crate::model::{ActivityAction, ActivityRecord, TimeEntry};
use crate::storage::StoreState;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct TimerStart {
    pub started: TimeEntry,
    /// The owner's timer that was running before, now ended.
    pub stopped: Option<TimeEntry>,
}

/// Start a timer on a live work item, ending the owner's running timer first.
pub fn start_timer(
    state: &mut StoreState,
    owner_id: UserId,
    work_item_id: EntityId,
    note: &str,
    now: DateTime<Utc>,
) -> Result<TimerStart> {
    let project_id = state.live_work_item(work_item_id)?.project_id;

    let stopped = match state.running_timer(owner_id).map(|entry| entry.id) {
        Some(running_id) => Some(finish_entry(state, running_id, owner_id, now)?),
        None => None,
    };

    let started = TimeEntry {
        id: Uuid::new_v4(),
        owner_id,
        work_item_id,
        project_id,
        started_at: now,
        ended_at: None,
        duration_seconds: None,
        note: note.trim().to_string(),
        manual: false,
        version: 1,
    };
    state.time_entries.insert(started.id, started.clone());
    state.append_activity(ActivityRecord::new(
        project_id,
        EntityType::TimeEntry,
        started.id,
        ActivityAction::TimerStarted,
        owner_id,
        now,
    ));

    Ok(TimerStart { started, stopped })
}

/// Stop a running timer. Only its owner may stop it.
pub fn stop_timer(
    state: &mut StoreState,
    entry_id: EntityId,
    owner_id: UserId,
    expected_version: Option<u64>,
    now: DateTime<Utc>,
) -> Result<TimeEntry> {
    let entry = state.time_entry(entry_id)?;
    if entry.owner_id != owner_id {
        return Err(MutationError::Forbidden);
    }
    if let Some(expected) = expected_version {
        check_version(entry, expected)?;
    }
    if !entry.is_running() {
        return Err(MutationError::version_conflict(
            format!("timer '{entry_id}' is already stopped"),
            entry.version,
        ));
    }
    finish_entry(state, entry_id, owner_id, now)
}

fn finish_entry(
    state: &mut StoreState,
    entry_id: EntityId,
    actor_id: UserId,
    now: DateTime<Utc>,
) -> Result<TimeEntry> {
    let before = state.time_entry(entry_id)?.clone();
    let mut entry = before.clone();
    entry.finish(now);
    entry.bump_version(now);

    let mut changes = ChangeSet::new();
    changes.value("ended_at", &before.ended_at, &entry.ended_at);
    changes.value("duration_seconds", &before.duration_seconds, &entry.duration_seconds);

    state.time_entries.insert(entry_id, entry.clone());
    state.append_activity(
        ActivityRecord::new(
            entry.project_id,
            EntityType::TimeEntry,
            entry_id,
            ActivityAction::TimerStopped,
            actor_id,
            now,
        )
        .with_changes(changes.into_changes()),
    );
    Ok(entry)
}

/// Bounds for an after-the-fact entry: ends after it starts, no longer than
/// the configured ceiling, and not meaningfully in the future.
pub fn validate_manual_entry(
    policy: &TimerPolicy,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if ended_at <= started_at {
        return Err(MutationError::validation("ended_at", "ended_at must be after started_at"));
    }

    let ceiling = millis(policy.max_manual_duration_ms);
    if ended_at - started_at > ceiling {
        return Err(MutationError::validation(
            "ended_at",
            format!("entry may cover at most {} minutes", ceiling.num_minutes()),
        ));
    }

    let latest = now + millis(policy.clock_skew_tolerance_ms);
    if started_at > latest {
        return Err(MutationError::validation("started_at", "started_at lies in the future"));
    }
    if ended_at > latest {
        return Err(MutationError::validation("ended_at", "ended_at lies in the future"));
    }
    Ok(())
}

/// Record a manual entry. Manual entries do not touch running timers.
#[allow(clippy::too_many_arguments)]
pub fn log_manual_time(
    state: &mut StoreState,
    policy: &TimerPolicy,
    owner_id: UserId,
    work_item_id: EntityId,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    note: &str,
    now: DateTime<Utc>,
) -> Result<TimeEntry> {
    validate_manual_entry(policy, started_at, ended_at, now)?;
    let project_id = state.live_work_item(work_item_id)?.project_id;

    let mut entry = TimeEntry {
        id: Uuid::new_v4(),
        owner_id,
        work_item_id,
        project_id,
        started_at,
        ended_at: None,
        duration_seconds: None,
        note: note.trim().to_string(),
        manual: true,
        version: 1,
    };
    entry.finish(ended_at);

    state.time_entries.insert(entry.id, entry.clone());
    state.append_activity(ActivityRecord::new(
        project_id,
        EntityType::TimeEntry,
        entry.id,
        ActivityAction::TimeLogged,
        owner_id,
        now,
    ));
    Ok(entry)
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, WorkItem, WorkItemStatus};

    fn state_with_items(count: usize) -> (StoreState, Vec<EntityId>) {
        let mut state = StoreState::default();
        let now = Utc::now();
        let project = Project::new("Apollo", now);
        let mut ids = Vec::new();
        for n in 0..count {
            let item = WorkItem {
                id: Uuid::new_v4(),
                project_id: project.id,
                parent_id: None,
                sprint_id: None,
                title: format!("item {n}"),
                description: String::new(),
                status: WorkItemStatus::Todo,
                priority: Default::default(),
                assignee_id: None,
                estimate_minutes: None,
                version: 1,
                created_by: Uuid::nil(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            ids.push(item.id);
            state.work_items.insert(item.id, item);
        }
        state.projects.insert(project.id, project);
        (state, ids)
    }

    #[test]
    fn starting_a_second_timer_stops_the_first() {
        let (mut state, items) = state_with_items(2);
        let owner = Uuid::new_v4();
        let t0 = Utc::now();

        let first = start_timer(&mut state, owner, items[0], "", t0).unwrap();
        assert!(first.stopped.is_none());

        let t1 = t0 + Duration::seconds(90);
        let second = start_timer(&mut state, owner, items[1], "review", t1).unwrap();
        let stopped = second.stopped.unwrap();
        assert_eq!(stopped.id, first.started.id);
        assert_eq!(stopped.ended_at, Some(t1));
        assert_eq!(stopped.duration_seconds, Some(90));
        assert_eq!(stopped.version, 2);

        assert_eq!(state.running_timer(owner).map(|e| e.id), Some(second.started.id));
        assert_eq!(state.activity_count(), 3);
    }

    #[test]
    fn other_owners_are_unaffected() {
        let (mut state, items) = state_with_items(1);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        start_timer(&mut state, alice, items[0], "", now).unwrap();
        let started = start_timer(&mut state, bob, items[0], "", now).unwrap();
        assert!(started.stopped.is_none());
        assert!(state.running_timer(alice).is_some());
    }

    #[test]
    fn stop_checks_owner_and_state() {
        let (mut state, items) = state_with_items(1);
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let entry = start_timer(&mut state, owner, items[0], "", now).unwrap().started;

        assert_eq!(
            stop_timer(&mut state, entry.id, Uuid::new_v4(), None, now),
            Err(MutationError::Forbidden)
        );
        let stopped = stop_timer(&mut state, entry.id, owner, Some(1), now).unwrap();
        assert_eq!(stopped.version, 2);

        match stop_timer(&mut state, entry.id, owner, None, now) {
            Err(MutationError::Conflict { .. }) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn timers_need_a_live_work_item() {
        let (mut state, _) = state_with_items(0);
        let missing = Uuid::new_v4();
        assert_eq!(
            start_timer(&mut state, Uuid::new_v4(), missing, "", Utc::now()),
            Err(MutationError::not_found("work_item", missing))
        );
    }

    #[test]
    fn manual_entry_bounds() {
        let policy = TimerPolicy::default();
        let now = Utc::now();
        let hour = Duration::hours(1);

        assert!(validate_manual_entry(&policy, now - hour, now, now).is_ok());
        assert!(validate_manual_entry(&policy, now, now, now).is_err());
        assert!(validate_manual_entry(&policy, now - Duration::hours(25), now, now).is_err());
        assert!(validate_manual_entry(&policy, now, now + Duration::minutes(4), now).is_ok());
        assert!(validate_manual_entry(&policy, now, now + hour, now).is_err());
    }

    #[test]
    fn manual_entries_bypass_exclusivity() {
        let (mut state, items) = state_with_items(1);
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let running = start_timer(&mut state, owner, items[0], "", now).unwrap().started;

        let logged = log_manual_time(
            &mut state,
            &TimerPolicy::default(),
            owner,
            items[0],
            now - Duration::hours(2),
            now - Duration::hours(1),
            "standup",
            now,
        )
        .unwrap();
        assert!(logged.manual);
        assert_eq!(logged.duration_seconds, Some(3600));
        assert_eq!(state.running_timer(owner).map(|e| e.id), Some(running.id));
    }
}
