//! Face catalog synchronization library
//!
//! Keeps the relational catalog, the object store and the external face
//! providers eventually consistent.

pub mod blob;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod provider;
pub mod recognition;
pub mod storage;
pub mod summary;
pub mod sync;
pub mod utils;

pub use config::Config;
pub use error::{SyncError, SyncResult};
