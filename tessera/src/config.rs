//! Process configuration: one YAML document with topology, router and key
//! generator sections.
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tessera_keygen::{KeygenConfig, KeygenError};
use tessera_router::RouterConfig;
use tessera_shard::{TopologyConfig, TopologyError};

/// File looked up in the home directory when no path is given.
pub const DEFAULT_FILE: &str = ".tessera.yaml";

/// Router deadline used when the config does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read {}: {source}", .path.display())]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The document is not valid YAML for this schema.
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The topology is inconsistent.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// The key generator settings are out of range.
    #[error(transparent)]
    Keygen(#[from] KeygenError),
}

/// Whole-process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Shards and sharding rule.
    pub topology: TopologyConfig,
    /// Router deadline.
    pub router: RouterConfig,
    /// Record id generator.
    pub keygen: KeygenConfig,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            router: RouterConfig { timeout_ms: Some(DEFAULT_TIMEOUT_MS) },
            keygen: KeygenConfig::default(),
        }
    }
}

impl TesseraConfig {
    /// Pick the config file: `explicit` if given, else `$HOME/.tessera.yaml`
    /// when it exists.
    pub fn locate(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit.or_else(|| {
            BaseDirs::new()
                .map(|b| b.home_dir().join(DEFAULT_FILE))
                .filter(|p| p.exists())
        })
    }

    /// Load from `path`, or built-in defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_yaml(&doc)
    }

    /// Parse a YAML document. Missing sections take their defaults.
    pub fn from_yaml(doc: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(doc)?)
    }
}
