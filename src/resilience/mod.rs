pub mod circuit_breaker;
pub mod store;

pub use circuit_breaker::{
    Admission, BreakerCore, BreakerOpen, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use store::ResilientStore;
