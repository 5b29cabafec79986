//! Beanckup Engine Library
//!
//! Incremental, content-addressed backup of episode directories: scan,
//! diff against the last manifest, review the annotated tree, then package
//! only what changed as a cancellable, progress-observable task.

pub mod config;
pub mod diff;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod repository;
pub mod store;
pub mod transfer;
pub mod tree;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use diff::ChangeInfo;
pub use executor::{
    BackupPreparationResult, BackupResult, BackupTask, PrepareRequest, RunRequest, TaskDriver, TaskPhase,
};
pub use manifest::{DirInfo, FileInfo, FileStatus, Manifest};
pub use repository::{Episode, EpisodeRepository, EpisodeStatus};
pub use store::{JsonManifestStore, ManifestStore, MemoryManifestStore};
pub use transfer::progress::TaskStatus;
pub use tree::TreeNode;
pub use utils::errors::{EngineError, Result};
