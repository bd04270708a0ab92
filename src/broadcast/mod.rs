//! Publish/subscribe delivery of committed changes.
//!
//! The dispatcher hands each committed change to [`BroadcastFanout::publish`],
//! which only enqueues. A background worker looks up the project's subscribers
//! in the [`SessionRegistry`] and pushes into each session's bounded inbox.
//! Every failure along the way is logged and dropped; peers that miss an event
//! re-fetch on reconnect.

use crate::config::BroadcastPolicy;
use crate::core::ProjectId;
use crate::dispatch::{Change, MutationResponse};
use crate::worker::BackgroundWorker;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{Level, debug, event, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// A confirmed change as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub project_id: ProjectId,
    pub response: MutationResponse,
}

#[derive(Default)]
struct SessionTable {
    inboxes: HashMap<SessionId, mpsc::Sender<BroadcastMessage>>,
    subscribers: HashMap<ProjectId, HashSet<SessionId>>,
}

/// Live sessions and the projects each is subscribed to.
#[derive(Default)]
pub struct SessionRegistry {
    table: RwLock<SessionTable>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: SessionId, inbox: mpsc::Sender<BroadcastMessage>) {
        self.write().inboxes.insert(session_id, inbox);
    }

    /// Forget the session and all of its subscriptions.
    pub fn unregister(&self, session_id: SessionId) {
        let mut table = self.write();
        table.inboxes.remove(&session_id);
        table.subscribers.retain(|_, sessions| {
            sessions.remove(&session_id);
            !sessions.is_empty()
        });
    }

    pub fn subscribe(&self, session_id: SessionId, project_id: ProjectId) {
        self.write()
            .subscribers
            .entry(project_id)
            .or_default()
            .insert(session_id);
    }

    pub fn unsubscribe(&self, session_id: SessionId, project_id: ProjectId) {
        let mut table = self.write();
        if let Some(sessions) = table.subscribers.get_mut(&project_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                table.subscribers.remove(&project_id);
            }
        }
    }

    pub fn subscriptions(&self, session_id: SessionId) -> Vec<ProjectId> {
        let table = self.read();
        let mut projects: Vec<ProjectId> = table
            .subscribers
            .iter()
            .filter(|(_, sessions)| sessions.contains(&session_id))
            .map(|(project_id, _)| *project_id)
            .collect();
        projects.sort();
        projects
    }

    pub fn session_count(&self) -> usize {
        self.read().inboxes.len()
    }

    /// Inboxes of every session subscribed to `project_id`, minus `exclude`.
    fn recipients(
        &self,
        project_id: ProjectId,
        exclude: Option<SessionId>,
    ) -> Vec<(SessionId, mpsc::Sender<BroadcastMessage>)> {
        let table = self.read();
        let Some(sessions) = table.subscribers.get(&project_id) else {
            return Vec::new();
        };
        sessions
            .iter()
            .filter(|session_id| Some(**session_id) != exclude)
            .filter_map(|session_id| {
                table
                    .inboxes
                    .get(session_id)
                    .map(|inbox| (*session_id, inbox.clone()))
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Envelope {
    message: BroadcastMessage,
    origin: Option<SessionId>,
}

/// Non-blocking publisher side of the fanout.
#[derive(Clone)]
pub struct BroadcastFanout {
    queue: mpsc::Sender<Envelope>,
}

impl BroadcastFanout {
    pub fn start(policy: &BroadcastPolicy, sessions: Arc<SessionRegistry>) -> (Self, BackgroundWorker) {
        let (queue, rx) = mpsc::channel(policy.queue_capacity.max(1));
        let worker = BackgroundWorker::spawn("broadcast-fanout", move |stop_rx| {
            run_fanout(sessions, rx, stop_rx)
        });
        (Self { queue }, worker)
    }

    /// Queue `change` for every subscriber of its project except `origin`.
    ///
    /// The broadcast carries its own message id, distinct from the one the
    /// originating caller got back.
    pub fn publish(&self, change: Change, origin: Option<SessionId>) {
        let message = BroadcastMessage {
            project_id: change.project_id,
            response: MutationResponse::committed(Uuid::new_v4().to_string(), change.payload),
        };
        match self.queue.try_send(Envelope { message, origin }) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => warn!(
                project = %envelope.message.project_id,
                "broadcast queue full, change dropped"
            ),
            Err(TrySendError::Closed(envelope)) => debug!(
                project = %envelope.message.project_id,
                "broadcast worker stopped, change dropped"
            ),
        }
    }
}

async fn run_fanout(
    sessions: Arc<SessionRegistry>,
    mut rx: mpsc::Receiver<Envelope>,
    mut stop_rx: tokio::sync::oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => deliver(&sessions, envelope),
                None => break,
            },
        }
    }
}

fn deliver(sessions: &SessionRegistry, envelope: Envelope) {
    let Envelope { message, origin } = envelope;
    let recipients = sessions.recipients(message.project_id, origin);
    let mut delivered = 0usize;

    for (session_id, inbox) in recipients {
        match inbox.try_send(message.clone()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => warn!(
                session = %session_id,
                project = %message.project_id,
                "session inbox full, broadcast dropped"
            ),
            Err(TrySendError::Closed(_)) => {
                debug!(session = %session_id, "session gone, broadcast dropped")
            }
        }
    }

    event!(
        Level::DEBUG,
        project = %message.project_id,
        message_id = %message.response.message_id,
        delivered,
        "broadcast delivered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityType;
    use crate::dispatch::Payload;
    use std::time::Duration;
    use tokio::time::timeout;

    fn removal(project_id: ProjectId) -> Change {
        Change {
            project_id,
            payload: Payload::Removed {
                entity_type: EntityType::Comment,
                id: Uuid::new_v4(),
                version: Some(2),
            },
        }
    }

    fn connect(registry: &SessionRegistry, buffer: usize) -> (SessionId, mpsc::Receiver<BroadcastMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        let session_id = Uuid::new_v4();
        registry.register(session_id, tx);
        (session_id, rx)
    }

    #[tokio::test]
    async fn subscribers_receive_except_origin() {
        let registry = Arc::new(SessionRegistry::new());
        let (fanout, worker) = BroadcastFanout::start(&BroadcastPolicy::default(), registry.clone());
        let project = Uuid::new_v4();

        let (origin, mut origin_rx) = connect(&registry, 8);
        let (peer, mut peer_rx) = connect(&registry, 8);
        let (_outsider, mut outsider_rx) = connect(&registry, 8);
        registry.subscribe(origin, project);
        registry.subscribe(peer, project);

        fanout.publish(removal(project), Some(origin));

        let message = timeout(Duration::from_secs(1), peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.project_id, project);
        assert!(message.response.is_committed());

        worker.stop().await;
        assert!(origin_rx.try_recv().is_err());
        assert!(outsider_rx.try_recv().is_err());
    }

    #[test]
    fn unregister_drops_subscriptions() {
        let registry = SessionRegistry::new();
        let (session, _rx) = connect(&registry, 1);
        let project = Uuid::new_v4();
        registry.subscribe(session, project);
        assert_eq!(registry.subscriptions(session), vec![project]);

        registry.unregister(session);
        assert!(registry.subscriptions(session).is_empty());
        assert_eq!(registry.session_count(), 0);
        assert!(registry.recipients(project, None).is_empty());
    }

    #[test]
    fn full_inbox_drops_without_blocking() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = connect(&registry, 1);
        let project = Uuid::new_v4();
        registry.subscribe(session, project);

        for _ in 0..3 {
            let message = BroadcastMessage {
                project_id: project,
                response: MutationResponse::committed(
                    Uuid::new_v4().to_string(),
                    removal(project).payload,
                ),
            };
            deliver(&registry, Envelope { message, origin: None });
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
