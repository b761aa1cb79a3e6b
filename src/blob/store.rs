//! Object store capability interface
//!
//! Thin wrapper over a single bucket. No business logic lives here.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::SyncResult;

/// Chunked body handed to [`ObjectStore::put`]; drained exactly once.
pub type PutBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync + 'static>>;

/// Result of a stat call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub etag: Option<String>,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Write the `size` bytes streamed by `body` under `key`
    async fn put(
        &self,
        key: &str,
        body: PutBody,
        size: u64,
        content_type: &str,
    ) -> SyncResult<()>;

    /// Metadata for `key`, `None` when the object does not exist
    async fn stat(&self, key: &str) -> SyncResult<Option<ObjectStat>>;

    async fn get(&self, key: &str) -> SyncResult<Bytes>;

    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// Time-limited GET url for `key`
    async fn presign_get(&self, key: &str, ttl: Duration) -> SyncResult<String>;
}
