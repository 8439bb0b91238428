//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`
//! so a settings file only needs the keys it overrides.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracelensSettings {
    pub database: DatabaseSettings,
    pub limits: LimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file holding both checkpoints and spans.
    pub path: PathBuf,
    /// Maximum pooled connections. Readers each take one.
    pub pool_size: u32,
    /// SQLite `busy_timeout` for a single statement.
    pub busy_timeout_ms: u64,
    /// Budget for one store operation, including waiting for a connection
    /// and retrying on lock contention.
    pub operation_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: tracelens_dir().join("tracelens.db"),
            pool_size: 8,
            busy_timeout_ms: 5_000,
            operation_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Candidate states above this are rejected.
    pub max_state_bytes: usize,
    /// Candidate states above this are accepted with a warning.
    pub warn_state_bytes: usize,
    /// `step_count` above this earns a possible-loop warning.
    pub step_count_warn_threshold: i64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_state_bytes: 10 * 1024 * 1024,
            warn_state_bytes: 1024 * 1024,
            step_count_warn_threshold: 50,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level directive, e.g. `info`. `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `tracelens_store => debug`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

/// `~/.tracelens`, or `/tmp/.tracelens` without a home directory.
pub fn tracelens_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tracelens")
}
