//! Configuration for the snapshot store.
//!
//! Loads configuration from a TOML file; every field has a usable default so
//! embedding applications can run without any file at all.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name of the storage directory created inside the workspace root
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// Size in bytes above which a freshly written container logs a warning.
    /// Informational only; nothing is rejected.
    #[serde(default = "default_max_snapshot_size")]
    pub max_snapshot_size: u64,

    /// Exclude patterns applied to every capture, on top of any the caller
    /// supplies per operation
    #[serde(default = "default_excludes")]
    pub default_excludes: Vec<String>,

    /// Auto-clean retention window in days. Carried for the caller, which
    /// deletes records older than the cutoff; the engine never acts on it.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn default_storage_dir() -> String {
    ".snapshots".to_string()
}

fn default_max_snapshot_size() -> u64 {
    100 * 1024 * 1024 // 100 MB
}

fn default_excludes() -> Vec<String> {
    [
        // Version control metadata
        ".git", ".svn", ".hg",
        // Build output
        "target", "node_modules", "dist", "build", "out",
        // Editor settings
        ".vscode", ".idea",
        // Logs
        "*.log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            storage_dir: default_storage_dir(),
            max_snapshot_size: default_max_snapshot_size(),
            default_excludes: default_excludes(),
            retention_days: None,
        }
    }
}

impl StoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StoreConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
