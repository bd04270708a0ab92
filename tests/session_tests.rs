mod common;

use common::{Fixture, work_item};
use plansync::core::{ErrorKind, PermissionLevel};
use plansync::server::{ClientMessage, ServerMessage};
use plansync::{EngineConfig, MutationRequest, Payload, RequestKind, SessionServer};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_broadcast_skips_origin_and_non_subscribers() {
    let fx = Fixture::new().await;
    let viewer = fx.member(PermissionLevel::View).await;
    let other = Fixture::over(fx.engine.clone()).await;

    let mut origin = fx.engine.connect(fx.owner);
    let mut peer = fx.engine.connect(viewer);
    let mut bystander = fx.engine.connect(other.owner);
    origin.subscribe(&[fx.project_id]).await.unwrap();
    peer.subscribe(&[fx.project_id]).await.unwrap();
    bystander.subscribe(&[other.project_id]).await.unwrap();

    let response = origin
        .request(
            MutationRequest::new(RequestKind::CreateWorkItem, fx.owner)
                .payload(json!({"project_id": fx.project_id, "title": "Shared plan"})),
        )
        .await;
    let item = work_item(&response);

    let message = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
    assert_eq!(message.project_id, fx.project_id);
    assert_ne!(message.response.message_id, response.message_id);
    assert_eq!(message.response.payload(), Some(&Payload::WorkItem(item)));

    assert!(origin.try_recv().is_none());
    assert!(bystander.try_recv().is_none());
}

#[tokio::test]
async fn test_only_committed_changes_are_broadcast() {
    let fx = Fixture::new().await;
    let mut peer = fx.engine.connect(fx.owner);
    peer.subscribe(&[fx.project_id]).await.unwrap();

    let item = fx.create_item("Quiet").await;
    let created = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
    assert_eq!(created.response.payload(), Some(&Payload::WorkItem(item.clone())));

    // Reads and rejected writes stay silent.
    fx.engine
        .dispatch(MutationRequest::new(RequestKind::GetWorkItem, fx.owner).target(item.id))
        .await;
    fx.engine
        .dispatch(
            MutationRequest::new(RequestKind::UpdateWorkItem, fx.owner)
                .target(item.id)
                .expected_version(7)
                .payload(json!({"title": "Stale"})),
        )
        .await;
    let update = MutationRequest::new(RequestKind::UpdateWorkItem, fx.owner)
        .target(item.id)
        .expected_version(1)
        .payload(json!({"title": "Loud"}));
    fx.engine.dispatch(update.clone()).await;
    // A replay re-sends nothing either.
    fx.engine.dispatch(update).await;

    let next = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
    let Some(Payload::WorkItem(updated)) = next.response.payload() else {
        panic!("expected the update, got {next:?}");
    };
    assert_eq!(updated.title, "Loud");

    tokio::task::yield_now().await;
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_subscribe_needs_view_on_every_project() {
    let fx = Fixture::new().await;
    let other = Fixture::over(fx.engine.clone()).await;
    let session = fx.engine.connect(fx.owner);

    let err = session
        .subscribe(&[fx.project_id, other.project_id])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(session.subscriptions().is_empty());

    assert_eq!(
        session.subscribe(&[fx.project_id]).await.unwrap(),
        vec![fx.project_id]
    );
    assert!(session.unsubscribe(&[fx.project_id]).is_empty());
}

#[tokio::test]
async fn test_closed_session_is_unregistered() {
    let fx = Fixture::new().await;
    let session = fx.engine.connect(fx.owner);
    assert_eq!(fx.engine.sessions().session_count(), 1);
    drop(session);
    assert_eq!(fx.engine.sessions().session_count(), 0);
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, message: &ClientMessage) {
        let mut line = serde_json::to_vec(message).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn next(&mut self) -> ServerMessage {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn join(&mut self, caller_id: Uuid, project_id: Uuid) {
        self.send(&ClientMessage::Hello { caller_id }).await;
        assert!(matches!(self.next().await, ServerMessage::Welcome { .. }));
        self.send(&ClientMessage::Subscribe {
            project_ids: vec![project_id],
        })
        .await;
        assert_eq!(
            self.next().await,
            ServerMessage::Subscribed {
                project_ids: vec![project_id]
            }
        );
    }
}

#[tokio::test]
async fn test_json_lines_session_over_tcp() {
    let fx = Fixture::new().await;
    let viewer = fx.member(PermissionLevel::View).await;

    let server = SessionServer::bind(fx.engine.clone(), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let mut writer = Client::connect(addr).await;
    writer.send(&ClientMessage::Ping).await;
    assert_eq!(writer.next().await, ServerMessage::Pong);
    writer.send(&ClientMessage::Ping).await;
    assert_eq!(writer.next().await, ServerMessage::Pong);
    writer.join(fx.owner, fx.project_id).await;

    let mut watcher = Client::connect(addr).await;
    watcher.send(&ClientMessage::Subscribe { project_ids: vec![fx.project_id] }).await;
    assert!(matches!(watcher.next().await, ServerMessage::Error { .. }));
    watcher.join(viewer, fx.project_id).await;

    let request = MutationRequest::new(RequestKind::CreateWorkItem, fx.owner)
        .message_id("tcp-1")
        .payload(json!({"project_id": fx.project_id, "title": "Over the wire"}));
    writer.send(&ClientMessage::Request { request }).await;

    let ServerMessage::Response { response } = writer.next().await else {
        panic!("expected a response");
    };
    assert_eq!(response.message_id, "tcp-1");
    let item = work_item(&response);

    let ServerMessage::Broadcast {
        project_id,
        response: broadcast,
    } = watcher.next().await
    else {
        panic!("expected a broadcast");
    };
    assert_eq!(project_id, fx.project_id);
    assert_eq!(broadcast.payload(), Some(&Payload::WorkItem(item)));

    // A viewer's write is answered with a structured error.
    let denied = MutationRequest::new(RequestKind::CreateWorkItem, viewer)
        .payload(json!({"project_id": fx.project_id, "title": "Nope"}));
    watcher.send(&ClientMessage::Request { request: denied }).await;
    let ServerMessage::Response { response } = watcher.next().await else {
        panic!("expected a response");
    };
    assert_eq!(response.error_body().unwrap().kind, ErrorKind::Forbidden);

    stop_tx.send(()).unwrap();
    server_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreadable_lines_keep_session_open() {
    let fx = Fixture::with_config(EngineConfig::new().max_line_bytes(256)).await;
    let server = SessionServer::bind(fx.engine.clone(), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_handle = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let mut client = Client::connect(addr).await;
    client.join(fx.owner, fx.project_id).await;

    client.send_raw(b"\xff\xfe garbage\n").await;
    let ServerMessage::Error { error } = client.next().await else {
        panic!("expected an error for a non UTF-8 line");
    };
    assert_eq!(error.kind, ErrorKind::Validation);

    let mut long_line = vec![b'{'; 4096];
    long_line.push(b'\n');
    client.send_raw(&long_line).await;
    let ServerMessage::Error { error } = client.next().await else {
        panic!("expected an error for an oversized line");
    };
    assert_eq!(error.kind, ErrorKind::Validation);

    // Still connected and still subscribed.
    client.send(&ClientMessage::Ping).await;
    assert_eq!(client.next().await, ServerMessage::Pong);
    let item = fx.create_item("After the noise").await;
    let ServerMessage::Broadcast { response, .. } = client.next().await else {
        panic!("expected a broadcast");
    };
    assert_eq!(response.payload(), Some(&Payload::WorkItem(item)));

    stop_tx.send(()).unwrap();
    server_handle.await.unwrap().unwrap();
}
