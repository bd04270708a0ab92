//! JSON-lines session server.
//!
//! Each line a client sends is one [`ClientMessage`]; each line it receives is
//! one [`ServerMessage`]. The first client message must be `hello`. Requests
//! are served concurrently, so responses may arrive out of order; match them
//! by `message_id`.
//!
//! A line that cannot be read as a message gets an `error` reply; the
//! connection stays open.

mod lines;

pub use lines::{Frame, LineReader};

use crate::core::{ErrorBody, MutationError, ProjectId, UserId};
use crate::dispatch::{MutationRequest, MutationResponse};
use crate::engine::{Engine, Session};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { caller_id: UserId },
    Subscribe { project_ids: Vec<ProjectId> },
    Unsubscribe { project_ids: Vec<ProjectId> },
    Request { request: MutationRequest },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { session_id: Uuid },
    Subscribed { project_ids: Vec<ProjectId> },
    Response { response: MutationResponse },
    Broadcast { project_id: ProjectId, response: MutationResponse },
    Error { error: ErrorBody },
    Pong,
}

impl ServerMessage {
    fn error(err: &MutationError) -> Self {
        Self::Error {
            error: ErrorBody::from(err),
        }
    }
}

pub struct SessionServer {
    engine: Engine,
    listener: TcpListener,
    connections_accepted: Arc<AtomicU64>,
}

impl SessionServer {
    pub async fn bind(engine: Engine, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            engine,
            listener,
            connections_accepted: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "session server listening");
        tokio::pin!(shutdown);

        loop {
            let (socket, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted?,
            };
            let count = self.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(peer = %peer, count, "connection accepted");

            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(engine, socket).await {
                    error!(peer = %peer, error = %err, "connection error");
                }
            });
        }

        info!("session server stopped accepting");
        Ok(())
    }

    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }
}

async fn serve_connection(engine: Engine, socket: TcpStream) -> io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = LineReader::new(reader, engine.config().server.max_line_bytes);

    let caller_id = loop {
        let Some(frame) = lines.next_frame().await? else {
            return Ok(());
        };
        match parse_frame(frame) {
            Ok(ClientMessage::Hello { caller_id }) => break caller_id,
            Ok(ClientMessage::Ping) => send(&mut writer, &ServerMessage::Pong).await?,
            Ok(_) => {
                let err = MutationError::validation("type", "hello must be the first message");
                send(&mut writer, &ServerMessage::error(&err)).await?;
            }
            Err(err) => send(&mut writer, &ServerMessage::error(&err)).await?,
        }
    };

    let mut session = engine.connect(caller_id);
    send(
        &mut writer,
        &ServerMessage::Welcome {
            session_id: session.id(),
        },
    )
    .await?;

    let buffer = engine.config().broadcast.session_buffer.max(1);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(buffer);

    loop {
        tokio::select! {
            frame = lines.next_frame() => {
                let Some(frame) = frame? else { break };
                if let Some(reply) = on_client_frame(&session, &out_tx, frame).await {
                    send(&mut writer, &reply).await?;
                }
            }
            Some(message) = out_rx.recv() => send(&mut writer, &message).await?,
            Some(broadcast) = session.recv() => {
                let message = ServerMessage::Broadcast {
                    project_id: broadcast.project_id,
                    response: broadcast.response,
                };
                send(&mut writer, &message).await?;
            }
        }
    }

    debug!(session = %session.id(), "client disconnected");
    Ok(())
}

/// Handle one frame. Requests are spawned and answer through `out_tx`;
/// everything else answers directly.
async fn on_client_frame(
    session: &Session,
    out_tx: &mpsc::Sender<ServerMessage>,
    frame: Frame,
) -> Option<ServerMessage> {
    let message = match parse_frame(frame) {
        Ok(message) => message,
        Err(err) => return Some(ServerMessage::error(&err)),
    };

    match message {
        ClientMessage::Hello { .. } => Some(ServerMessage::error(&MutationError::validation(
            "type",
            "session already established",
        ))),
        ClientMessage::Subscribe { project_ids } => match session.subscribe(&project_ids).await {
            Ok(project_ids) => Some(ServerMessage::Subscribed { project_ids }),
            Err(err) => Some(ServerMessage::error(&err)),
        },
        ClientMessage::Unsubscribe { project_ids } => Some(ServerMessage::Subscribed {
            project_ids: session.unsubscribe(&project_ids),
        }),
        ClientMessage::Request { request } => {
            let engine = session.engine().clone();
            let origin = session.origin();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let response = engine.dispatch_from(origin, request).await;
                if out_tx.send(ServerMessage::Response { response }).await.is_err() {
                    warn!("client gone before its response was ready");
                }
            });
            None
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

fn parse_frame(frame: Frame) -> Result<ClientMessage, MutationError> {
    match frame {
        Frame::Line(line) => parse(&line),
        Frame::Rejected(err) => {
            debug!(error = %err, "unreadable client line");
            Err(err)
        }
    }
}

fn parse(line: &str) -> Result<ClientMessage, MutationError> {
    serde_json::from_str(line).map_err(|err| MutationError::validation("message", err.to_string()))
}

async fn send(writer: &mut OwnedWriteHalf, message: &ServerMessage) -> io::Result<()> {
    let mut bytes = serde_json::to_vec(message).map_err(io::Error::other)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}
