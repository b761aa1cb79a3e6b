//! Content-addressable uploader
//!
//! The payload is handed to the store as zero-copy slices of the caller's
//! buffer and hashed as each slice is pulled, so it is walked once and never
//! copied. After the write a stat call fetches the store-assigned etag.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::store::ObjectStore;
use crate::error::{SyncError, SyncResult};
use crate::model::BlobCoordinates;

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

const CHUNK_SIZE: usize = 64 * 1024;

/// Chunk stream over a shared payload feeding every chunk it yields into a
/// SHA-256 accumulator.
pub struct HashingStream {
    data: Bytes,
    offset: usize,
    state: Arc<Mutex<HashState>>,
}

#[derive(Default)]
struct HashState {
    hasher: Sha256,
    bytes: u64,
}

/// Handle to read the digest once the stream has been drained.
pub struct HashHandle {
    state: Arc<Mutex<HashState>>,
}

impl HashingStream {
    pub fn new(data: Bytes) -> (Self, HashHandle) {
        let state = Arc::new(Mutex::new(HashState::default()));
        let handle = HashHandle {
            state: state.clone(),
        };
        (
            Self {
                data,
                offset: 0,
                state,
            },
            handle,
        )
    }
}

impl HashHandle {
    /// Lower-case hex digest and byte count of everything yielded so far
    pub fn finish(&self) -> (String, u64) {
        let state = self.state.lock();
        (hex::encode(state.hasher.clone().finalize()), state.bytes)
    }
}

impl Stream for HashingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.offset >= this.data.len() {
            return Poll::Ready(None);
        }

        let end = (this.offset + CHUNK_SIZE).min(this.data.len());
        let chunk = this.data.slice(this.offset..end);
        this.offset = end;

        let mut state = this.state.lock();
        state.hasher.update(&chunk);
        state.bytes += chunk.len() as u64;
        Poll::Ready(Some(Ok(chunk)))
    }
}

/// Uploads blobs and reports the coordinates to persist.
pub struct ContentAddressableUploader<O: ObjectStore + ?Sized> {
    store: Arc<O>,
}

impl<O: ObjectStore + ?Sized> Clone for ContentAddressableUploader<O> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<O: ObjectStore + ?Sized> ContentAddressableUploader<O> {
    pub fn new(store: Arc<O>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<O> {
        &self.store
    }

    /// Store `data` under `key` and return the full coordinate set.
    pub async fn upload(&self, key: &str, data: Bytes) -> SyncResult<BlobCoordinates> {
        let size = data.len();
        let (body, hash) = HashingStream::new(data);
        self.store
            .put(key, Box::pin(body), size as u64, JPEG_CONTENT_TYPE)
            .await?;

        let (sha256, written) = hash.finish();
        if written != size as u64 {
            return Err(SyncError::StorageIntegrity {
                key: key.to_string(),
                reason: format!("store consumed {} of {} bytes", written, size),
            });
        }

        let stat = self
            .store
            .stat(key)
            .await?
            .ok_or_else(|| SyncError::StorageIntegrity {
                key: key.to_string(),
                reason: "object missing after write".to_string(),
            })?;
        let etag = stat
            .etag
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SyncError::StorageIntegrity {
                key: key.to_string(),
                reason: "stat returned no etag".to_string(),
            })?;

        debug!("Uploaded {} ({} bytes, sha256 {})", key, written, sha256);
        Ok(BlobCoordinates {
            key: key.to_string(),
            sha256,
            etag,
            size: written as i64,
        })
    }
}
