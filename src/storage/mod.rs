pub mod memory;
pub mod persistence;
pub mod state;

pub use memory::MemoryStore;
pub use state::StoreState;
