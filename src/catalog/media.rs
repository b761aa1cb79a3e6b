//! Stored-key to short-lived URL resolution

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::blob::ObjectStore;

#[derive(Clone)]
pub struct MediaUrlResolver {
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
}

impl MediaUrlResolver {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Presigned GET url for `key`. Failures degrade to `None`.
    pub async fn resolve(&self, key: Option<&str>) -> Option<String> {
        let key = key.filter(|k| !k.is_empty())?;
        match self.store.presign_get(key, self.ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Failed to resolve media url for {}: {}", key, e);
                None
            }
        }
    }
}
