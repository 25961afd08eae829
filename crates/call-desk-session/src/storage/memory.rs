//! In-memory metrics storage.

use std::sync::RwLock;

use async_trait::async_trait;
use call_desk_core::{MetricsStorage, PersistedMetrics, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and single-process runs.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStorage {
    metrics: RwLock<Option<PersistedMetrics>>,
}

impl MemoryStorage {
    /// Create an empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage that already holds `metrics`.
    #[must_use]
    pub fn with_metrics(metrics: PersistedMetrics) -> Self {
        Self {
            metrics: RwLock::new(Some(metrics)),
        }
    }
}

#[async_trait]
impl MetricsStorage for MemoryStorage {
    async fn load(&self) -> Result<Option<PersistedMetrics>, StorageError> {
        Ok(self
            .metrics
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn save(&self, metrics: &PersistedMetrics) -> Result<(), StorageError> {
        *self
            .metrics
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = Some(metrics.clone());
        Ok(())
    }
}
