use crate::core::{EntityId, PermissionLevel, Result};
use crate::dispatch::{Handler, HandlerOutput, MutationRequest, Payload, RequestContext, RequestKind};
use crate::engine::exclusivity::{log_manual_time, start_timer, stop_timer};
use crate::guard::Scope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

const MAX_NOTE_LEN: usize = 1_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartPayload {
    work_item_id: EntityId,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManualPayload {
    work_item_id: EntityId,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    #[serde(default)]
    note: String,
}

pub struct StartTimer;

#[async_trait]
impl Handler for StartTimer {
    fn kind(&self) -> RequestKind {
        RequestKind::StartTimer
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: StartPayload = request.parse_payload()?;
        Ok(Scope::WorkItem(payload.work_item_id))
    }

    /// Stops the caller's running timer, if any, in the same transaction.
    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let payload: StartPayload = request.parse_payload()?;
        let note = super::bounded_text("note", &payload.note, MAX_NOTE_LEN)?;
        let project_id = ctx.project()?;
        let owner = ctx.caller_id;
        let now = Utc::now();

        let outcome = ctx
            .store()
            .transaction("start_timer", |state| {
                start_timer(state, owner, payload.work_item_id, &note, now)
            })
            .await?;

        let payload = Payload::TimerStarted {
            started: outcome.started.clone(),
            stopped: outcome.stopped.clone(),
        };
        let mut output = HandlerOutput::committed(project_id, payload);
        // A timer stopped in another project is news there too.
        if let Some(stopped) = outcome.stopped {
            if stopped.project_id != project_id {
                output = output.also_notify(stopped.project_id, Payload::Timer(stopped));
            }
        }
        Ok(output)
    }
}

pub struct StopTimer;

#[async_trait]
impl Handler for StopTimer {
    fn kind(&self) -> RequestKind {
        RequestKind::StopTimer
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::View
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        Ok(Scope::TimeEntry(request.require_target()?))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let id = request.require_target()?;
        let expected = request.expected_version;
        let project_id = ctx.project()?;
        let owner = ctx.caller_id;
        let now = Utc::now();

        let entry = ctx
            .store()
            .transaction("stop_timer", |state| stop_timer(state, id, owner, expected, now))
            .await?;
        Ok(HandlerOutput::committed(project_id, Payload::Timer(entry)))
    }
}

pub struct LogManualTime;

#[async_trait]
impl Handler for LogManualTime {
    fn kind(&self) -> RequestKind {
        RequestKind::LogManualTime
    }

    fn required_level(&self) -> PermissionLevel {
        PermissionLevel::Edit
    }

    fn scope(&self, request: &MutationRequest) -> Result<Scope> {
        let payload: ManualPayload = request.parse_payload()?;
        Ok(Scope::WorkItem(payload.work_item_id))
    }

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput> {
        let payload: ManualPayload = request.parse_payload()?;
        let note = super::bounded_text("note", &payload.note, MAX_NOTE_LEN)?;
        let project_id = ctx.project()?;
        let policy = ctx.config().timers.clone();
        let owner = ctx.caller_id;
        let now = Utc::now();

        let entry = ctx
            .store()
            .transaction("log_manual_time", |state| {
                log_manual_time(
                    state,
                    &policy,
                    owner,
                    payload.work_item_id,
                    payload.started_at,
                    payload.ended_at,
                    &note,
                    now,
                )
            })
            .await?;
        Ok(HandlerOutput::committed(project_id, Payload::Timer(entry)))
    }
}
