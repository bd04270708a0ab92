mod common;

use chrono::{Duration, Utc};
use common::{Fixture, error, error_kind, timer};
use plansync::core::PermissionLevel;
use plansync::model::{ActivityAction, DependencyKind};
use plansync::{EngineConfig, ErrorKind, MutationRequest, Payload, RequestKind};
use serde_json::json;

#[tokio::test]
async fn test_one_running_timer_per_user() {
    let fx = Fixture::new().await;
    let first_item = fx.create_item("Design").await;
    let second_item = fx.create_item("Build").await;

    let start = |item_id: uuid::Uuid| {
        MutationRequest::new(RequestKind::StartTimer, fx.owner)
            .payload(json!({"work_item_id": item_id, "note": "focus"}))
    };

    let first = fx.engine.dispatch(start(first_item.id)).await;
    let Some(Payload::TimerStarted { started: running, stopped: None }) = first.payload() else {
        panic!("expected a fresh timer, got {first:?}");
    };
    assert!(running.is_running());

    let second = fx.engine.dispatch(start(second_item.id)).await;
    let Some(Payload::TimerStarted {
        started,
        stopped: Some(stopped),
    }) = second.payload()
    else {
        panic!("expected the first timer to be stopped, got {second:?}");
    };
    assert_eq!(stopped.id, running.id);
    assert!(!stopped.is_running());
    assert!(stopped.duration_seconds.is_some());
    assert_eq!(started.work_item_id, second_item.id);

    let current = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::CurrentTimer, fx.owner))
        .await;
    assert_eq!(
        current.payload(),
        Some(&Payload::CurrentTimer(Some(started.clone())))
    );

    let actions: Vec<ActivityAction> = fx
        .engine
        .store()
        .read(|state| state.activity.iter().map(|record| record.action).collect())
        .await
        .unwrap();
    assert_eq!(
        &actions[2..],
        &[
            ActivityAction::TimerStarted,
            ActivityAction::TimerStopped,
            ActivityAction::TimerStarted,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_leave_one_timer_running() {
    let fx = Fixture::new().await;
    let mut item_ids = Vec::new();
    for n in 0..8 {
        item_ids.push(fx.create_item(&format!("Task {n}")).await.id);
    }

    let mut handles = vec![];
    for item_id in item_ids {
        let engine = fx.engine.clone();
        let request = MutationRequest::new(RequestKind::StartTimer, fx.owner)
            .payload(json!({"work_item_id": item_id}));
        handles.push(tokio::spawn(async move { engine.dispatch(request).await }));
    }

    let mut stopped_by_start = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        let Some(Payload::TimerStarted { started, stopped }) = response.payload() else {
            panic!("every start should commit, got {response:?}");
        };
        assert!(started.is_running());
        if stopped.is_some() {
            stopped_by_start += 1;
        }
    }
    assert_eq!(stopped_by_start, 7);

    let entries: Vec<_> = fx
        .engine
        .store()
        .read(|state| {
            state
                .time_entries
                .values()
                .filter(|entry| entry.owner_id == fx.owner)
                .cloned()
                .collect()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 8);
    assert_eq!(entries.iter().filter(|entry| entry.ended_at.is_none()).count(), 1);
    for entry in entries.iter().filter(|entry| !entry.is_running()) {
        assert!(entry.duration_seconds.is_some());
    }
}

#[tokio::test]
async fn test_timers_are_per_owner() {
    let fx = Fixture::new().await;
    let item = fx.create_item("Pairing").await;
    let partner = fx.member(PermissionLevel::Edit).await;

    let mine_started = fx
        .engine
        .dispatch(
            MutationRequest::new(RequestKind::StartTimer, fx.owner)
                .payload(json!({"work_item_id": item.id})),
        )
        .await;
    let theirs_started = fx
        .engine
        .dispatch(
            MutationRequest::new(RequestKind::StartTimer, partner)
                .payload(json!({"work_item_id": item.id})),
        )
        .await;
    let (
        Some(Payload::TimerStarted { started: mine, stopped: None }),
        Some(Payload::TimerStarted { stopped: None, .. }),
    ) = (mine_started.payload(), theirs_started.payload())
    else {
        panic!("both timers should start without stopping anything");
    };

    // Only the owner may stop a timer.
    let hijack = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::StopTimer, partner).target(mine.id))
        .await;
    assert_eq!(error_kind(&hijack), ErrorKind::Forbidden);

    let stopped = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::StopTimer, fx.owner).target(mine.id))
        .await;
    let entry = timer(&stopped);
    assert!(!entry.is_running());
    assert_eq!(entry.version, mine.version + 1);

    let again = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::StopTimer, fx.owner).target(mine.id))
        .await;
    let body = error(&again);
    assert_eq!(body.kind, ErrorKind::Conflict);
    assert_eq!(body.current_version, Some(entry.version));
}

#[tokio::test]
async fn test_manual_time_bounds() {
    let fx = Fixture::with_config(
        EngineConfig::new().max_manual_duration(std::time::Duration::from_secs(4 * 60 * 60)),
    )
    .await;
    let item = fx.create_item("Retro").await;
    let now = Utc::now();

    let log = |started: chrono::DateTime<Utc>, ended: chrono::DateTime<Utc>| {
        MutationRequest::new(RequestKind::LogManualTime, fx.owner).payload(json!({
            "work_item_id": item.id,
            "started_at": started,
            "ended_at": ended,
        }))
    };

    let logged = fx
        .engine
        .dispatch(log(now - Duration::hours(2), now - Duration::hours(1)))
        .await;
    let entry = timer(&logged);
    assert!(entry.manual);
    assert_eq!(entry.duration_seconds, Some(3_600));

    let reversed = fx
        .engine
        .dispatch(log(now - Duration::hours(1), now - Duration::hours(2)))
        .await;
    assert_eq!(error(&reversed).field.as_deref(), Some("ended_at"));

    let too_long = fx
        .engine
        .dispatch(log(now - Duration::hours(6), now - Duration::hours(1)))
        .await;
    assert_eq!(error_kind(&too_long), ErrorKind::Validation);

    let future = fx
        .engine
        .dispatch(log(now + Duration::hours(1), now + Duration::hours(2)))
        .await;
    assert_eq!(error(&future).field.as_deref(), Some("started_at"));
}

#[tokio::test]
async fn test_blocking_cycle_reports_path() {
    let fx = Fixture::new().await;
    let a = fx.create_item("A").await;
    let b = fx.create_item("B").await;
    let c = fx.create_item("C").await;

    let link = |from: &plansync::model::WorkItem, to: &plansync::model::WorkItem, kind: &str| {
        MutationRequest::new(RequestKind::AddDependency, fx.owner)
            .payload(json!({"from_id": from.id, "to_id": to.id, "kind": kind}))
    };

    assert!(fx.engine.dispatch(link(&a, &b, "blocking")).await.is_committed());
    assert!(fx.engine.dispatch(link(&b, &c, "blocking")).await.is_committed());
    let before = fx.activity_count().await;

    let closing = fx.engine.dispatch(link(&c, &a, "blocking")).await;
    let body = error(&closing);
    assert_eq!(body.kind, ErrorKind::Conflict);
    assert_eq!(body.path, Some(vec![a.id, b.id, c.id]));
    assert_eq!(fx.activity_count().await, before);

    let informational = fx.engine.dispatch(link(&c, &a, "informational")).await;
    let Some(Payload::Dependency(edge)) = informational.payload() else {
        panic!("expected an edge, got {informational:?}");
    };
    assert_eq!(edge.kind, DependencyKind::Informational);

    let duplicate = fx.engine.dispatch(link(&a, &b, "informational")).await;
    let body = error(&duplicate);
    assert_eq!(body.kind, ErrorKind::Conflict);
    assert!(body.existing_id.is_some());
}

#[tokio::test]
async fn test_self_dependency_and_removal() {
    let fx = Fixture::new().await;
    let a = fx.create_item("A").await;
    let b = fx.create_item("B").await;

    let own = fx
        .engine
        .dispatch(
            MutationRequest::new(RequestKind::AddDependency, fx.owner)
                .payload(json!({"from_id": a.id, "to_id": a.id})),
        )
        .await;
    let body = error(&own);
    assert_eq!(body.kind, ErrorKind::Validation);
    assert_eq!(body.field.as_deref(), Some("to_id"));

    let added = fx
        .engine
        .dispatch(
            MutationRequest::new(RequestKind::AddDependency, fx.owner)
                .payload(json!({"from_id": a.id, "to_id": b.id})),
        )
        .await;
    let Some(Payload::Dependency(edge)) = added.payload() else {
        panic!("expected an edge, got {added:?}");
    };
    assert_eq!(edge.kind, DependencyKind::Blocking);

    let listed = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::ListDependencies, fx.owner).target(b.id))
        .await;
    assert_eq!(listed.payload(), Some(&Payload::Dependencies(vec![edge.clone()])));

    let removed = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::RemoveDependency, fx.owner).target(edge.id))
        .await;
    assert!(removed.is_committed());

    let listed = fx
        .engine
        .dispatch(MutationRequest::new(RequestKind::ListDependencies, fx.owner).target(a.id))
        .await;
    assert_eq!(listed.payload(), Some(&Payload::Dependencies(vec![])));
}

#[tokio::test]
async fn test_reparent_under_descendant_is_rejected() {
    let fx = Fixture::new().await;
    let epic = fx.create_item("Epic").await;
    let story = common::work_item(
        &fx.engine
            .dispatch(
                MutationRequest::new(RequestKind::CreateWorkItem, fx.owner).payload(json!({
                    "project_id": fx.project_id,
                    "title": "Story",
                    "parent_id": epic.id,
                })),
            )
            .await,
    );

    let response = fx
        .engine
        .dispatch(
            MutationRequest::new(RequestKind::UpdateWorkItem, fx.owner)
                .target(epic.id)
                .expected_version(1)
                .payload(json!({"parent_id": story.id})),
        )
        .await;
    let body = error(&response);
    assert_eq!(body.kind, ErrorKind::Conflict);
    assert_eq!(body.path, Some(vec![story.id, epic.id]));
}
