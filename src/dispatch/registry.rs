use super::handlers;
use super::{HandlerOutput, MutationRequest, RequestKind};
use crate::config::EngineConfig;
use crate::core::{MutationError, PermissionLevel, ProjectId, Result, UserId};
use crate::engine::EngineContext;
use crate::guard::Scope;
use crate::resilience::ResilientStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a handler may touch while serving one request.
pub struct RequestContext {
    pub engine: Arc<EngineContext>,
    pub caller_id: UserId,
    pub correlation_id: Uuid,
    /// Owning project resolved by the authorization guard.
    pub project_id: Option<ProjectId>,
}

impl RequestContext {
    pub fn store(&self) -> &ResilientStore {
        &self.engine.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    pub fn project(&self) -> Result<ProjectId> {
        self.project_id.ok_or_else(|| {
            MutationError::Internal("handler requires a project-scoped request".to_string())
        })
    }
}

/// Business logic for one request kind.
///
/// The dispatcher runs idempotency and authorization before `handle`; a
/// handler only sees requests its caller is allowed to make.
#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> RequestKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn required_level(&self) -> PermissionLevel;

    /// What the request touches, for authorization.
    fn scope(&self, request: &MutationRequest) -> Result<Scope>;

    async fn handle(&self, ctx: &RequestContext, request: &MutationRequest) -> Result<HandlerOutput>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<RequestKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for its kind, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        handlers::register_defaults(&mut registry);
        registry
    }

    pub fn get(&self, kind: RequestKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn list_handlers(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.values().map(|h| h.name()).collect();
        names.sort_unstable();
        names
    }
}
