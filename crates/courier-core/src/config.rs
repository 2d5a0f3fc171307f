//! Queue configuration: optional TOML file, then environment overrides.
//!
//! ```toml
//! data_dir = "/var/lib/courier"
//! persistence = "enabled"
//! schema_version = 1
//! background_safety_margin_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Lane;
use crate::queue::{BlobFile, StoreLocation};

pub const ENV_DATA_DIR: &str = "COURIER_DATA_DIR";
pub const ENV_PERSISTENCE: &str = "COURIER_PERSISTENCE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid COURIER_PERSISTENCE value {0:?} (expected \"enabled\" or \"disabled\")")]
    InvalidPersistence(String),
}

/// Whether stores write through to disk.
///
/// `Disabled` is for sandboxed extension processes: a poisoned queue there
/// would otherwise crash the extension on every launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    #[default]
    Enabled,
    Disabled,
}

impl std::str::FromStr for PersistenceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "on" | "true" | "1" => Ok(PersistenceMode::Enabled),
            "disabled" | "off" | "false" | "0" => Ok(PersistenceMode::Disabled),
            other => Err(ConfigError::InvalidPersistence(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Falls back to `<platform data dir>/courier`.
    pub data_dir: Option<PathBuf>,

    pub persistence: PersistenceMode,

    /// Blobs written with another version are discarded on load.
    pub schema_version: u32,

    /// Background completion fires once this little time is left.
    pub background_safety_margin_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            persistence: PersistenceMode::Enabled,
            schema_version: 1,
            background_safety_margin_secs: 5,
        }
    }
}

impl QueueConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `COURIER_DATA_DIR` / `COURIER_PERSISTENCE` on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(
            std::env::var(ENV_DATA_DIR).ok(),
            std::env::var(ENV_PERSISTENCE).ok(),
        )
    }

    fn with_overrides(
        mut self,
        data_dir: Option<String>,
        persistence: Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = data_dir.filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(mode) = persistence {
            self.persistence = mode.parse()?;
        }
        Ok(self)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceMode) -> Self {
        self.persistence = persistence;
        self
    }

    /// Configured directory, else the platform data dir. `None` when neither exists.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("courier")))
    }

    pub fn background_safety_margin(&self) -> Duration {
        Duration::from_secs(self.background_safety_margin_secs)
    }

    pub fn lane_path(&self, lane: Lane) -> Option<PathBuf> {
        self.resolved_data_dir()
            .map(|d| d.join(format!("{}.json", lane.file_stem())))
    }

    pub fn counters_path(&self) -> Option<PathBuf> {
        self.resolved_data_dir().map(|d| d.join("counters.json"))
    }

    /// Where a lane keeps its snapshot, honouring the persistence mode.
    pub fn lane_location(&self, lane: Lane) -> Option<StoreLocation> {
        self.location(self.lane_path(lane))
    }

    pub fn counters_location(&self) -> Option<StoreLocation> {
        self.location(self.counters_path())
    }

    fn location(&self, path: Option<PathBuf>) -> Option<StoreLocation> {
        match self.persistence {
            PersistenceMode::Disabled => Some(StoreLocation::InMemory),
            PersistenceMode::Enabled => {
                path.map(|p| StoreLocation::File(BlobFile::new(p, self.schema_version)))
            }
        }
    }
}
