//! Error taxonomy shared by the uploader, providers and the sync engine.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the library.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Object store unreachable or refused the write.
    #[error("object store unavailable: {0}")]
    StorageUnavailable(String),

    /// The write went through but the post-write check did not confirm it.
    #[error("object store integrity check failed for {key}: {reason}")]
    StorageIntegrity { key: String, reason: String },

    /// Face vendor unreachable or rate limited.
    #[error("face provider unavailable: {message}")]
    ProviderUnavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Credentials or permissions refused; nothing will work until fixed.
    #[error("face provider refused credentials: {0}")]
    ProviderUnauthorized(String),

    /// Face vendor permanently rejected one item.
    #[error("face provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("catalog error: {0}")]
    Catalog(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        SyncError::ProviderUnavailable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        SyncError::NotFound { entity, id }
    }

    /// Whether the same call may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StorageUnavailable(_)
                | SyncError::StorageIntegrity { .. }
                | SyncError::ProviderUnavailable { .. }
        )
    }

    /// Vendor supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::ProviderUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Errors that mean the whole backend is gone rather than one item being bad.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SyncError::StorageUnavailable(_)
                | SyncError::ProviderUnavailable { .. }
                | SyncError::ProviderUnauthorized(_)
                | SyncError::Catalog(_)
                | SyncError::Cancelled
        )
    }
}
