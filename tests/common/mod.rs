#![allow(dead_code)]

use plansync::core::{PermissionLevel, ProjectId, UserId};
use plansync::model::{TimeEntry, WorkItem};
use plansync::{Engine, EngineConfig, ErrorBody, ErrorKind, MutationRequest, MutationResponse, Payload, RequestKind};
use serde_json::json;
use uuid::Uuid;

pub struct Fixture {
    pub engine: Engine,
    pub owner: UserId,
    pub project_id: ProjectId,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::new()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let engine = Engine::open(config).await.unwrap();
        Self::over(engine).await
    }

    pub async fn over(engine: Engine) -> Self {
        let owner = Uuid::new_v4();
        let project = engine.store().seed_project("Apollo", owner).await.unwrap();
        Self {
            engine,
            owner,
            project_id: project.id,
        }
    }

    /// A new project member at `level`.
    pub async fn member(&self, level: PermissionLevel) -> UserId {
        let user = Uuid::new_v4();
        self.engine
            .store()
            .grant(self.project_id, user, level)
            .await
            .unwrap();
        user
    }

    pub async fn create_item(&self, title: &str) -> WorkItem {
        let response = self
            .engine
            .dispatch(
                MutationRequest::new(RequestKind::CreateWorkItem, self.owner)
                    .payload(json!({"project_id": self.project_id, "title": title})),
            )
            .await;
        work_item(&response)
    }

    pub async fn activity_count(&self) -> usize {
        self.engine
            .store()
            .read(|state| state.activity_count())
            .await
            .unwrap()
    }
}

pub fn work_item(response: &MutationResponse) -> WorkItem {
    match response.payload() {
        Some(Payload::WorkItem(item)) => item.clone(),
        other => panic!("expected a work item, got {other:?} in {response:?}"),
    }
}

pub fn timer(response: &MutationResponse) -> TimeEntry {
    match response.payload() {
        Some(Payload::Timer(entry)) => entry.clone(),
        other => panic!("expected a timer, got {other:?} in {response:?}"),
    }
}

pub fn error(response: &MutationResponse) -> ErrorBody {
    match response.error_body() {
        Some(body) => body.clone(),
        None => panic!("expected an error, got {response:?}"),
    }
}

pub fn error_kind(response: &MutationResponse) -> ErrorKind {
    error(response).kind
}
