//! The mutation engine: shared context, lifecycle and sessions.

pub mod change_tracker;
pub mod concurrency;
pub mod dependency;
pub mod exclusivity;
mod session;

pub use change_tracker::ChangeSet;
pub use concurrency::{StatusMachine, Versioned};
pub use dependency::{CycleError, DependencyGraph};
pub use exclusivity::TimerStart;
pub use session::Session;

use crate::broadcast::{BroadcastFanout, SessionRegistry};
use crate::config::EngineConfig;
use crate::core::{StoreResult, UserId};
use crate::dispatch::{Dispatcher, Handler, HandlerRegistry, MutationRequest, MutationResponse, Origin};
use crate::guard::{Authorizer, IdempotencyGuard};
use crate::resilience::ResilientStore;
use crate::storage::MemoryStore;
use crate::worker::BackgroundWorker;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// State shared by every handler. Owned explicitly and passed down; there
/// are no globals.
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: ResilientStore,
    pub idempotency: Arc<IdempotencyGuard>,
    pub authorizer: Authorizer,
    pub sessions: Arc<SessionRegistry>,
    pub fanout: BroadcastFanout,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    dispatcher: Dispatcher,
    workers: Mutex<Vec<BackgroundWorker>>,
}

/// Cheaply cloneable handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            registry: HandlerRegistry::with_default_handlers(),
        }
    }

    /// Open the configured store (loading its snapshot) and start the engine.
    pub async fn open(config: EngineConfig) -> StoreResult<Self> {
        Self::builder(config).build().await
    }

    /// Start an engine over an existing store. Must run inside a tokio runtime.
    pub fn start(config: EngineConfig, store: Arc<MemoryStore>) -> Self {
        Self::assemble(config, store, HandlerRegistry::with_default_handlers())
    }

    fn assemble(config: EngineConfig, memory: Arc<MemoryStore>, registry: HandlerRegistry) -> Self {
        let store = ResilientStore::new(memory, &config.breaker, config.retry.clone());
        let sessions = Arc::new(SessionRegistry::new());
        let (idempotency, writer) = IdempotencyGuard::start(&config.idempotency, store.clone());
        let (fanout, fanout_worker) = BroadcastFanout::start(&config.broadcast, sessions.clone());

        let ctx = Arc::new(EngineContext {
            authorizer: Authorizer::new(store.clone()),
            config,
            store,
            idempotency,
            sessions,
            fanout,
        });
        info!(handlers = registry.list_handlers().len(), "engine started");

        Self {
            inner: Arc::new(EngineInner {
                dispatcher: Dispatcher::new(ctx.clone(), registry),
                ctx,
                workers: Mutex::new(vec![writer, fanout_worker]),
            }),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.inner.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    /// The underlying store, for seeding and inspection.
    pub fn store(&self) -> &Arc<MemoryStore> {
        self.inner.ctx.store.inner()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.ctx.sessions
    }

    /// Serve a request from a trusted in-process caller. Nothing is excluded
    /// from the broadcast.
    pub async fn dispatch(&self, request: MutationRequest) -> MutationResponse {
        let origin = Origin::local(request.caller_id);
        self.inner.dispatcher.dispatch(origin, request).await
    }

    pub async fn dispatch_from(&self, origin: Origin, request: MutationRequest) -> MutationResponse {
        self.inner.dispatcher.dispatch(origin, request).await
    }

    /// Open a session for `caller_id`. It receives broadcasts for the projects
    /// it subscribes to, and its own requests are not echoed back to it.
    pub fn connect(&self, caller_id: UserId) -> Session {
        Session::open(self.clone(), caller_id)
    }

    /// Stop the background workers, flushing queued idempotency writes.
    pub async fn shutdown(&self) {
        let workers: Vec<BackgroundWorker> = {
            let mut guard = self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            worker.stop().await;
        }
        info!("engine stopped");
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<MemoryStore>>,
    registry: HandlerRegistry,
}

impl EngineBuilder {
    /// Use this store instead of opening the configured one.
    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the handler for the handler's request kind.
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.registry.register(handler);
        self
    }

    pub async fn build(self) -> StoreResult<Engine> {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::open(&self.config.store).await?),
        };
        Ok(Engine::assemble(self.config, store, self.registry))
    }
}
