use super::registry::{Handler, HandlerRegistry, RequestContext};
use super::{Change, HandlerOutput, MutationRequest, MutationResponse, Outcome};
use crate::broadcast::SessionId;
use crate::core::{MutationError, Result, UserId};
use crate::engine::EngineContext;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, Level, debug, error, event, info_span, warn};
use uuid::Uuid;

/// Who sent a request: the authenticated caller and, for network sessions,
/// the session to leave out of the resulting broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub caller_id: UserId,
    pub session_id: Option<SessionId>,
}

impl Origin {
    /// An in-process caller with no session to exclude.
    pub fn local(caller_id: UserId) -> Self {
        Self {
            caller_id,
            session_id: None,
        }
    }

    pub fn session(caller_id: UserId, session_id: SessionId) -> Self {
        Self {
            caller_id,
            session_id: Some(session_id),
        }
    }
}

/// Routes requests to handlers and owns the per-request pipeline:
/// idempotency check, authorization, handler, response caching, broadcast.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<EngineContext>,
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EngineContext>, registry: HandlerRegistry) -> Self {
        Self {
            ctx,
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Serve one request. Never fails: every error becomes a response.
    pub async fn dispatch(&self, origin: Origin, request: MutationRequest) -> MutationResponse {
        let correlation_id = Uuid::new_v4();
        let span = info_span!(
            "dispatch",
            handler = request.kind.as_str(),
            caller = %origin.caller_id,
            correlation_id = %correlation_id,
            message_id = %request.message_id
        );

        async move {
            let started = Instant::now();
            let (response, changes) = self.process(origin, correlation_id, &request).await;

            for change in changes {
                self.ctx.fanout.publish(change, origin.session_id);
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &response.outcome {
                Outcome::Committed(_) => event!(Level::INFO, elapsed_ms, "request served"),
                Outcome::Error(body) => {
                    event!(Level::INFO, elapsed_ms, kind = ?body.kind, "request rejected")
                }
            }
            response
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        origin: Origin,
        correlation_id: Uuid,
        request: &MutationRequest,
    ) -> (MutationResponse, Vec<Change>) {
        let message_id = request.message_id.as_str();
        if message_id.trim().is_empty() {
            let err = MutationError::validation("message_id", "message_id must not be empty");
            return (MutationResponse::error(message_id, &err), Vec::new());
        }
        if request.caller_id != origin.caller_id {
            warn!(claimed = %request.caller_id, "caller id does not match session identity");
            return (
                MutationResponse::error(message_id, &MutationError::Forbidden),
                Vec::new(),
            );
        }
        let Some(handler) = self.registry.get(request.kind) else {
            error!(kind = %request.kind, "no handler registered");
            let err = MutationError::Internal(format!("no handler for '{}'", request.kind));
            return (MutationResponse::error(message_id, &err), Vec::new());
        };

        let mutating = request.kind.is_mutating();
        if mutating {
            match self.ctx.idempotency.check(origin.caller_id, message_id).await {
                Ok(Some(cached)) => {
                    event!(Level::INFO, "idempotent replay");
                    return (cached, Vec::new());
                }
                Ok(None) => {}
                Err(err) => return (MutationResponse::error(message_id, &err), Vec::new()),
            }
        }

        let result = AssertUnwindSafe(self.execute(handler.as_ref(), origin, correlation_id, request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                error!(handler = handler.name(), panic = %message, "handler panicked");
                Err(MutationError::Internal(message))
            });

        let (response, changes) = match result {
            Ok(output) => (
                MutationResponse::committed(message_id, output.payload),
                output.changes,
            ),
            Err(err) => {
                match &err {
                    MutationError::Internal(detail) => error!(detail = %detail, "handler failed"),
                    MutationError::ServiceUnavailable(detail) => {
                        warn!(detail = %detail, "store unavailable")
                    }
                    other => debug!(error = %other, "request rejected by handler"),
                }
                (MutationResponse::error(message_id, &err), Vec::new())
            }
        };

        if mutating {
            self.ctx.idempotency.store(origin.caller_id, &response).await;
        }
        (response, changes)
    }

    async fn execute(
        &self,
        handler: &dyn Handler,
        origin: Origin,
        correlation_id: Uuid,
        request: &MutationRequest,
    ) -> Result<HandlerOutput> {
        let scope = handler.scope(request)?;
        let project_id = self
            .ctx
            .authorizer
            .authorize(origin.caller_id, scope, handler.required_level())
            .await?;

        let ctx = RequestContext {
            engine: self.ctx.clone(),
            caller_id: origin.caller_id,
            correlation_id,
            project_id,
        };
        handler.handle(&ctx, request).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
