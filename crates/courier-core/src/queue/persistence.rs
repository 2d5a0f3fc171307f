//! Versioned blob persistence.
//!
//! Layout on disk:
//!
//! ```text
//! {"version": 1, "entries": [ ... ]}
//! ```
//!
//! Writes go to a sibling `.tmp` file first and are renamed over the target,
//! so a crash mid-write leaves the previous snapshot intact.
//! Reads never fail: a missing, foreign-version or unreadable blob loads
//! as an empty list.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::domain::QueueError;

#[derive(Serialize)]
struct BlobOut<'a, T> {
    version: u32,
    entries: &'a [T],
}

#[derive(Deserialize)]
struct BlobHeader {
    version: u64,
}

#[derive(Deserialize)]
struct BlobIn<T> {
    entries: Vec<T>,
}

/// A schema-versioned JSON file holding a list of `T`.
#[derive(Debug, Clone)]
pub struct BlobFile {
    path: PathBuf,
    version: u32,
}

impl BlobFile {
    pub fn new(path: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            path: path.into(),
            version,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Load the list, distinguishing why it could not be read.
    ///
    /// A missing file is `Ok(empty)`.
    pub async fn try_load<T: DeserializeOwned>(&self) -> Result<Vec<T>, QueueError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::persistence(&self.path, e)),
        };

        let header: BlobHeader =
            serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if header.version != u64::from(self.version) {
            return Err(QueueError::SchemaMismatch {
                found: header.version,
                expected: self.version,
            });
        }

        let blob: BlobIn<T> =
            serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(blob.entries)
    }

    /// Load the list; any failure is logged and yields an empty list.
    ///
    /// Foreign-version blobs are deleted so the next write starts clean.
    pub async fn load_or_empty<T: DeserializeOwned>(&self) -> Vec<T> {
        match self.try_load().await {
            Ok(entries) => {
                debug!(path = %self.path.display(), count = entries.len(), "loaded blob");
                entries
            }
            Err(QueueError::SchemaMismatch { found, expected }) => {
                info!(
                    path = %self.path.display(),
                    found,
                    expected,
                    "discarding blob written by another schema version"
                );
                if let Err(e) = tokio::fs::remove_file(&self.path).await {
                    debug!(path = %self.path.display(), error = %e, "could not remove stale blob");
                }
                Vec::new()
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "blob is corrupted, starting empty");
                Vec::new()
            }
        }
    }

    /// Serialize the whole list and atomically replace the file.
    pub async fn save<T: Serialize>(&self, entries: &[T]) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(&BlobOut {
            version: self.version,
            entries,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QueueError::persistence(parent, e))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| QueueError::persistence(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| QueueError::persistence(&self.path, e))?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
