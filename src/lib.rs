// ============================================================================
// plansync
// ============================================================================
//
//! Server-side mutation engine for shared team planning data.
//!
//! Clients send typed [`MutationRequest`]s over a persistent session. Each
//! mutating request passes the idempotency guard, then authorization, then its
//! handler, whose store work runs as one transaction behind a circuit breaker.
//! Committed changes are fanned out to every other session subscribed to the
//! affected project.
//!
//! ```
//! use plansync::{Engine, EngineConfig, MutationRequest, RequestKind};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! # tokio_test::block_on(async {
//! let engine = Engine::open(EngineConfig::new()).await.unwrap();
//! let owner = Uuid::new_v4();
//! let project = engine.store().seed_project("Apollo", owner).await.unwrap();
//!
//! let create = MutationRequest::new(RequestKind::CreateWorkItem, owner)
//!     .payload(json!({"project_id": project.id, "title": "Kickoff"}));
//! let first = engine.dispatch(create.clone()).await;
//! let replay = engine.dispatch(create).await;
//! assert!(first.is_committed());
//! assert_eq!(first, replay);
//!
//! engine.shutdown().await;
//! # });
//! ```

pub mod broadcast;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod guard;
pub mod model;
pub mod resilience;
pub mod server;
pub mod storage;
mod worker;

pub use broadcast::{BroadcastMessage, SessionId};
pub use config::{EngineConfig, RetryPolicy};
pub use core::{ErrorBody, ErrorKind, MutationError, PermissionLevel, Result};
pub use dispatch::{MutationRequest, MutationResponse, Outcome, Payload, RequestKind};
pub use engine::{Engine, Session};
pub use server::SessionServer;
pub use storage::MemoryStore;
