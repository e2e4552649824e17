//! Configuration - エンジンの設定値
//!
//! JSON の一部だけを書いても残りは既定値で埋まります（`#[serde(default)]`）。
//! 検証は `EngineBuilder::build` の時点で行います（Fail-fast）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Upper bound on records handed to the backends and not yet finished.
    pub max_scheduler_limit: usize,
    pub max_concurrent_workers: usize,
    pub min_periodic_interval_ms: u64,
    /// How long an interrupted handler may keep running before it is aborted.
    pub stop_grace_period_ms: u64,
    /// Persist to this JSON file instead of keeping records in memory.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_scheduler_limit: 20,
            max_concurrent_workers: 4,
            min_periodic_interval_ms: 15 * 60 * 1000,
            stop_grace_period_ms: 10_000,
            snapshot_path: None,
        }
    }
}

impl Configuration {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_scheduler_limit == 0 {
            return Err(ConfigError::Invalid(
                "max_scheduler_limit must be at least 1".into(),
            ));
        }
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn min_periodic_interval(&self) -> Duration {
        Duration::from_millis(self.min_periodic_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}
