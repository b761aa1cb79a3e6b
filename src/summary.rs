//! Per-batch outcome reporting

use serde::Serialize;
use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
    pub retryable: bool,
}

/// Counts and failing ids for one batch.
///
/// Failures of individual items never abort their siblings; they are
/// collected here instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub operation: String,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
    /// Items left untouched on purpose; the next run picks them up again.
    pub deferred: Vec<String>,
    /// Set when the batch stopped early (cancellation or a backend outage).
    pub aborted: Option<String>,
}

impl BatchSummary {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, id: impl ToString, error: &SyncError) {
        let id = id.to_string();
        warn!("{}: item {} failed: {}", self.operation, id, error);
        self.failed += 1;
        self.failures.push(ItemFailure {
            id,
            error: error.to_string(),
            retryable: error.is_retryable(),
        });
    }

    pub fn record_deferred(&mut self, id: impl ToString) {
        self.deferred.push(id.to_string());
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.aborted.is_none() {
            self.aborted = Some(reason.into());
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.id.as_str()).collect()
    }

    /// Fold another batch's counts into this one
    pub fn merge(&mut self, other: BatchSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        self.deferred.extend(other.deferred);
        if let Some(reason) = other.aborted {
            self.abort(reason);
        }
    }
}
