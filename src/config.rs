//! Engine tuning knobs and their TOML form.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime options for an [`AssetTree`](crate::AssetTree).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeOptions {
    /// Batches larger than this skip incremental propagation and schedule a
    /// reconciliation instead.
    pub incremental_batch_limit: usize,
    /// How long reconcile requests for one hierarchy are merged before the
    /// job runs.
    pub coalesce_window: Duration,
    /// Upper bound on waiting for the tree lock; `None` waits forever.
    pub lock_acquire_timeout: Option<Duration>,
    /// SQLite busy handler timeout.
    pub busy_timeout: Duration,
    /// Prefix for auto-named children ("New node 3").
    pub new_node_name: String,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            incremental_batch_limit: 1000,
            coalesce_window: Duration::from_secs(5),
            lock_acquire_timeout: None,
            busy_timeout: Duration::from_secs(5),
            new_node_name: "New node".to_string(),
        }
    }
}

impl TreeOptions {
    /// Parses a `[tree]` TOML document; absent fields keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawFile = toml::from_str(input).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        raw.tree.into_options()
    }

    /// Reads options from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawFile = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        raw.tree.into_options()
    }

    /// Renders the options back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        let raw = RawFile {
            tree: RawOptions::from(self),
            database: DatabaseSection::default(),
        };
        toml::to_string_pretty(&raw).map_err(|source| ConfigError::Serialize { source })
    }
}

/// Default location of the operator config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("nodetree").join("config.toml"))
}

/// Database path named by a config file's `[database] default` entry.
pub fn default_database_path(path: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawFile = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: Some(path.to_path_buf()),
        source,
    })?;
    Ok(raw.database.default_path)
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawFile {
    #[serde(default)]
    tree: RawOptions,
    #[serde(default)]
    database: DatabaseSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DatabaseSection {
    #[serde(rename = "default", skip_serializing_if = "Option::is_none")]
    default_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    incremental_batch_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    coalesce_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_acquire_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    busy_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_node_name: Option<String>,
}

impl RawOptions {
    fn into_options(self) -> Result<TreeOptions, ConfigError> {
        let mut opts = TreeOptions::default();
        if let Some(limit) = self.incremental_batch_limit {
            if limit == 0 {
                return Err(ConfigError::Invalid {
                    field: "incremental_batch_limit",
                    reason: "must be at least 1".into(),
                });
            }
            opts.incremental_batch_limit = limit;
        }
        if let Some(ms) = self.coalesce_window_ms {
            opts.coalesce_window = Duration::from_millis(ms);
        }
        if let Some(ms) = self.lock_acquire_timeout_ms {
            opts.lock_acquire_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.busy_timeout_ms {
            opts.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(name) = self.new_node_name {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "new_node_name",
                    reason: "must not be blank".into(),
                });
            }
            opts.new_node_name = name;
        }
        Ok(opts)
    }
}

impl From<&TreeOptions> for RawOptions {
    fn from(opts: &TreeOptions) -> Self {
        Self {
            incremental_batch_limit: Some(opts.incremental_batch_limit),
            coalesce_window_ms: Some(opts.coalesce_window.as_millis() as u64),
            lock_acquire_timeout_ms: opts.lock_acquire_timeout.map(|t| t.as_millis() as u64),
            busy_timeout_ms: Some(opts.busy_timeout.as_millis() as u64),
            new_node_name: Some(opts.new_node_name.clone()),
        }
    }
}

/// Failures while loading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {source}")]
    Parse {
        /// File path, when parsing a file.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Options could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
    /// A field holds an unusable value.
    #[error("config field {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
