use super::Engine;
use crate::broadcast::{BroadcastMessage, SessionId};
use crate::core::{PermissionLevel, ProjectId, Result, UserId};
use crate::dispatch::{MutationRequest, MutationResponse, Origin};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One connected client. Unregisters itself when dropped.
pub struct Session {
    id: SessionId,
    caller_id: UserId,
    engine: Engine,
    inbox: mpsc::Receiver<BroadcastMessage>,
}

impl Session {
    pub(super) fn open(engine: Engine, caller_id: UserId) -> Self {
        let (tx, inbox) = mpsc::channel(engine.config().broadcast.session_buffer.max(1));
        let id = Uuid::new_v4();
        engine.sessions().register(id, tx);
        debug!(session = %id, caller = %caller_id, "session opened");
        Self {
            id,
            caller_id,
            engine,
            inbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn caller_id(&self) -> UserId {
        self.caller_id
    }

    pub fn origin(&self) -> Origin {
        Origin::session(self.caller_id, self.id)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Subscribe to every listed project, or none of them: each needs View.
    pub async fn subscribe(&self, project_ids: &[ProjectId]) -> Result<Vec<ProjectId>> {
        let authorizer = &self.engine.context().authorizer;
        for &project_id in project_ids {
            authorizer
                .check_permission(self.caller_id, project_id, PermissionLevel::View)
                .await?;
        }
        for &project_id in project_ids {
            self.engine.sessions().subscribe(self.id, project_id);
        }
        Ok(self.subscriptions())
    }

    pub fn unsubscribe(&self, project_ids: &[ProjectId]) -> Vec<ProjectId> {
        for &project_id in project_ids {
            self.engine.sessions().unsubscribe(self.id, project_id);
        }
        self.subscriptions()
    }

    pub fn subscriptions(&self) -> Vec<ProjectId> {
        self.engine.sessions().subscriptions(self.id)
    }

    /// Send a request as this session. The resulting broadcast skips it.
    pub async fn request(&self, request: MutationRequest) -> MutationResponse {
        self.engine.dispatch_from(self.origin(), request).await
    }

    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.engine.sessions().unregister(self.id);
        debug!(session = %self.id, "session closed");
    }
}
