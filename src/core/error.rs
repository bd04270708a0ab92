use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Mutation errors (the caller-facing taxonomy)
// ============================================================================

/// Self-healing context attached to every conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictContext {
    /// The entity's current version; re-fetch and retry with this version.
    CurrentVersion(u64),
    /// Ids along the cycle the rejected edge would close, starting at its target.
    CyclePath(Vec<Uuid>),
    /// The already-existing row that the request collided with.
    Existing(Uuid),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Validation error: {message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("forbidden")]
    Forbidden,

    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        context: ConflictContext,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MutationError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn version_conflict(message: impl Into<String>, current_version: u64) -> Self {
        Self::Conflict {
            message: message.into(),
            context: ConflictContext::CurrentVersion(current_version),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may retry the same logical attempt later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }
}

impl From<StoreError> for MutationError {
    fn from(err: StoreError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

// ============================================================================
// Wire form
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    ServiceUnavailable,
    Internal,
}

/// Structured error returned to callers: `{kind, message, field?}` plus conflict context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<Uuid>,
}

impl From<&MutationError> for ErrorBody {
    fn from(err: &MutationError) -> Self {
        let mut body = ErrorBody {
            kind: err.kind(),
            message: err.to_string(),
            field: None,
            current_version: None,
            path: None,
            existing_id: None,
        };

        match err {
            MutationError::Validation { field, message } => {
                body.field = field.clone();
                body.message = message.clone();
            }
            MutationError::Conflict { message, context } => {
                body.message = message.clone();
                match context {
                    ConflictContext::CurrentVersion(version) => {
                        body.current_version = Some(*version)
                    }
                    ConflictContext::CyclePath(path) => body.path = Some(path.clone()),
                    ConflictContext::Existing(id) => body.existing_id = Some(*id),
                }
            }
            // Internal details stay in the server log.
            MutationError::Internal(_) => body.message = "internal error".to_string(),
            _ => {}
        }

        body
    }
}

impl From<MutationError> for ErrorBody {
    fn from(err: MutationError) -> Self {
        Self::from(&err)
    }
}

// ============================================================================
// Store errors (infrastructure, counted by the circuit breaker)
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store lock not acquired within {0:?}")]
    Timeout(Duration),

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store snapshot is corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MutationError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
