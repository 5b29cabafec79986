//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or no file at all) is valid.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub packaging: PackagingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Follow symbolic links into their targets
    #[serde(default)]
    pub follow_links: bool,

    /// Path components excluded by exact name
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Include dot-files and dot-directories
    #[serde(default = "default_true")]
    pub include_hidden: bool,
}

/// How strictly unchanged-looking files are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// Trust size + modification time when both match.
    #[default]
    Fast,
    /// Re-hash every file present in the prior manifest.
    Verify,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffConfig {
    #[serde(default)]
    pub mode: DiffMode,

    /// Treat a corrupt prior manifest as a first backup instead of failing
    #[serde(default)]
    pub accept_corrupt_manifest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagingConfig {
    /// Total permits of the weighted I/O semaphore
    #[serde(default = "default_io_budget")]
    pub io_budget: u32,

    /// Number of files hashed concurrently
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,

    /// Skip copying content already present in the prior manifest
    #[serde(default = "default_true")]
    pub deduplicate: bool,

    /// Also write `<series>-<episode>-manifest.json` into the destination
    #[serde(default = "default_true")]
    pub deliver_manifest_copy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum interval between published status snapshots
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,

    /// Exponential smoothing factor for the reported speed
    #[serde(default = "default_speed_smoothing")]
    pub speed_smoothing: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `<series>/<episode>.manifest.json`
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_exclude_patterns() -> Vec<String> {
    vec![".beanckup".to_string()]
}

fn default_io_budget() -> u32 {
    64
}

fn default_hash_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 16)
}

fn default_publish_interval_ms() -> u64 {
    250
}

fn default_speed_smoothing() -> f64 {
    0.3
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from(".beanckup/manifests")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_patterns: default_exclude_patterns(),
            include_hidden: true,
        }
    }
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            io_budget: default_io_budget(),
            hash_workers: default_hash_workers(),
            deduplicate: true,
            deliver_manifest_copy: true,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: default_publish_interval_ms(),
            speed_smoothing: default_speed_smoothing(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.packaging.io_budget == 0 {
            return Err(EngineError::Config("packaging.io_budget must be at least 1".into()));
        }
        if self.packaging.hash_workers == 0 {
            return Err(EngineError::Config("packaging.hash_workers must be at least 1".into()));
        }
        let alpha = self.progress.speed_smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(EngineError::Config(format!(
                "progress.speed_smoothing must be in (0, 1], got {alpha}"
            )));
        }
        Ok(())
    }
}
