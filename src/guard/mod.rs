pub mod authorization;
pub mod idempotency;

pub use authorization::{Authorizer, Scope, require_level};
pub use idempotency::IdempotencyGuard;
