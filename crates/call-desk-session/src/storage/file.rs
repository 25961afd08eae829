//! JSON file metrics storage.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use call_desk_core::{MetricsStorage, PersistedMetrics, StorageError};

const FILE_NAME: &str = "metrics.json";

/// Stores metrics as one JSON document.
///
/// Saves go through a sibling temp file and a rename, so a crash mid-write
/// leaves the previous document in place.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/call-desk/metrics.json`, e.g. `~/.local/share/call-desk`
    /// on Linux.
    ///
    /// # Errors
    /// Returns error if the platform has no per-user data directory.
    pub fn in_data_dir() -> Result<Self, StorageError> {
        let dir = dirs::data_dir()
            .ok_or_else(|| StorageError::Internal("No user data directory".to_string()))?;
        Ok(Self::new(dir.join("call-desk").join(FILE_NAME)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsStorage for FileStorage {
    async fn load(&self) -> Result<Option<PersistedMetrics>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, metrics: &PersistedMetrics) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(metrics)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), "Metrics saved");
        Ok(())
    }
}
