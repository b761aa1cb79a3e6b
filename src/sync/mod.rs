//! Provider synchronization: persons, face enrollment, identification

pub mod engine;
pub mod retry;

pub use engine::{FaceSyncEngine, SyncReport};
pub use retry::RetryPolicy;
