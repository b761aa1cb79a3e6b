//! Reference data cache with explicit invalidation

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::SyncResult;

struct CacheState<T> {
    generation: u64,
    value: Option<Arc<T>>,
}

/// Lazily loaded value that the owning service drops on every mutation.
///
/// A load that started before an invalidation never installs its result, so
/// a reader cannot resurrect data older than the last mutation.
pub struct ReferenceDataCache<T> {
    state: RwLock<CacheState<T>>,
}

impl<T: Send + Sync> ReferenceDataCache<T> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                generation: 0,
                value: None,
            }),
        }
    }

    pub async fn get_or_load<F, Fut>(&self, load: F) -> SyncResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let generation = {
            let state = self.state.read();
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            state.generation
        };

        let loaded = Arc::new(load().await?);

        let mut state = self.state.write();
        if state.generation == generation {
            state.value = Some(loaded.clone());
        } else {
            debug!("Discarding reference data loaded before invalidation");
        }
        Ok(loaded)
    }

    /// Drop the cached value. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.state.write();
        state.generation += 1;
        state.value = None;
        state.generation
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().value.is_some()
    }
}

impl<T: Send + Sync> Default for ReferenceDataCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_loads_once_until_invalidated() {
        let cache = ReferenceDataCache::new();
        let loads = &AtomicUsize::new(0);
        let load = || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        };

        cache.get_or_load(load).await.unwrap();
        cache.get_or_load(load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(!cache.is_loaded());
        cache.get_or_load(load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_racing_invalidation_is_not_cached() {
        let cache = &ReferenceDataCache::new();

        let value = cache
            .get_or_load(|| async move {
                cache.invalidate();
                Ok("stale")
            })
            .await
            .unwrap();

        assert_eq!(*value, "stale");
        assert!(!cache.is_loaded());
    }
}
