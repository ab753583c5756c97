//! Node configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! none at all) yields a working local node.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parsing::validator::AcceptedType;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Gateway HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            bind: default_bind(),
        }
    }
}

/// Materialized store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            path: default_db_path(),
        }
    }
}

/// Chain intake knobs. The feed itself is external; these are the values
/// it is expected to honor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: i64,

    /// Blocks to wait before an event is considered settled.
    #[serde(default = "default_min_block_depth")]
    pub min_block_depth: u64,

    /// Skip transactions that were already executed.
    #[serde(default = "default_true")]
    pub dedup_executed_txns: bool,

    /// Seconds to wait before re-attempting a failed transaction.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            chain_id: default_chain_id(),
            min_block_depth: default_min_block_depth(),
            dedup_executed_txns: default_true(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

/// Core validator/processor knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Per-table cap on `count(*)` enforced after every insert. Zero
    /// disables the cap.
    #[serde(default)]
    pub max_row_count: usize,

    /// Relations under this prefix are unreachable from user SQL.
    #[serde(default = "default_system_table_prefix")]
    pub system_table_prefix: String,

    /// Override of the accepted CREATE TABLE column types. Absent means
    /// the built-in allow-list.
    #[serde(default)]
    pub accepted_column_types: Option<Vec<AcceptedType>>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_row_count: 0,
            system_table_prefix: default_system_table_prefix(),
            accepted_column_types: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8030".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("mesa.db")
}

fn default_chain_id() -> i64 {
    1
}

fn default_min_block_depth() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_system_table_prefix() -> String {
    "system_".to_string()
}
