//! Errors - エラー型と分類
//!
//! キューの「失敗」の大半はエラーとして表に出しません（ハンドラーの結果として
//! ストアに反映するだけ）。ここに並ぶのは呼び出し側が対処しうるものだけです。

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The coordinator actor has shut down; the command was not applied.
    #[error("queue coordinator is no longer running")]
    CoordinatorStopped,

    #[error("persistence i/o failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema version mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: u64, expected: u32 },

    #[error("corrupted blob at {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },
}

impl QueueError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}
