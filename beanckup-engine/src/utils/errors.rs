//! Custom error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The episode root itself could not be scanned.
    #[error("Scan error at {}: {reason}", path.display())]
    Scan { path: PathBuf, reason: String },

    /// The prior manifest exists but cannot be used as a diff baseline.
    #[error("Prior manifest for {series_id}/{episode_id} is unusable: {reason}")]
    Diff {
        series_id: String,
        episode_id: String,
        reason: String,
    },

    #[error("Write error at {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task cancelled after {processed_files} file(s)")]
    Cancelled { processed_files: usize },

    #[error("Backup failed after {processed_files} file(s): {source}")]
    TaskFailed {
        processed_files: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("A task is already running (phase: {0})")]
    TaskAlreadyRunning(String),

    #[error("Invalid task transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("Invalid episode status change: {from} -> {to}")]
    InvalidEpisodeStatus { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True for the clean cancellation terminal state.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }

    /// Number of files processed before a terminal task error, if known.
    pub fn processed_files(&self) -> Option<usize> {
        match self {
            EngineError::Cancelled { processed_files }
            | EngineError::TaskFailed { processed_files, .. } => Some(*processed_files),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
