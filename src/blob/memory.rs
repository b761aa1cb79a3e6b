//! In-process object store for tests and offline runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use bytes::BytesMut;
use futures::TryStreamExt;

use super::store::{ObjectStat, ObjectStore, PutBody};
use crate::error::{SyncError, SyncResult};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
    unavailable: AtomicBool,
    omit_etag: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `stat` report objects without an etag
    pub fn set_omit_etag(&self, omit: bool) {
        self.omit_etag.store(omit, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Seed an object directly, bypassing `put`
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.write().insert(key.to_string(), data.into());
    }

    fn check(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::StorageUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        mut body: PutBody,
        size: u64,
        _content_type: &str,
    ) -> SyncResult<()> {
        self.check()?;
        let mut buffer = BytesMut::with_capacity(size as usize);
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?
        {
            buffer.extend_from_slice(&chunk);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.write().insert(key.to_string(), buffer.freeze());
        Ok(())
    }

    async fn stat(&self, key: &str) -> SyncResult<Option<ObjectStat>> {
        self.check()?;
        let objects = self.objects.read();
        Ok(objects.get(key).map(|data| {
            let etag = if self.omit_etag.load(Ordering::SeqCst) {
                None
            } else {
                let digest = Sha256::digest(data);
                Some(format!("\"{}\"", hex::encode(&digest[..16])))
            };
            ObjectStat {
                etag,
                size: data.len() as i64,
            }
        }))
    }

    async fn get(&self, key: &str) -> SyncResult<Bytes> {
        self.check()?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::StorageIntegrity {
                key: key.to_string(),
                reason: "object is missing".to_string(),
            })
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.check()?;
        self.objects.write().remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> SyncResult<String> {
        self.check()?;
        Ok(format!("memory://{}?expires={}", key, ttl.as_secs()))
    }
}
