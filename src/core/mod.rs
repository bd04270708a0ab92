pub mod error;
pub mod types;

pub use error::{
    ConflictContext, ErrorBody, ErrorKind, MutationError, Result, StoreError, StoreResult,
};
pub use types::{EntityId, EntityType, PermissionLevel, ProjectId, UserId};
