//! Manifest types for incremental backup support.
//!
//! A manifest records every file and directory of an episode as of its last
//! backup, with size, mtime and content hash, so the next run can diff
//! against it and only package what changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Manifest schema version written by this engine.
pub const MANIFEST_VERSION: &str = "1.0";

/// Metadata key mapping deduplicated paths to the path holding their content
pub const DEDUPLICATED_KEY: &str = "deduplicated";

/// Classification of a path relative to the prior manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    New,
    Modified,
    Deleted,
    Unchanged,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileStatus::New => "new",
            FileStatus::Modified => "modified",
            FileStatus::Deleted => "deleted",
            FileStatus::Unchanged => "unchanged",
        };
        f.write_str(label)
    }
}

/// Metadata for a single file, keyed by its slash-normalized relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// Hex SHA-256 of the content; empty until computed
    #[serde(default)]
    pub content_hash: String,
    pub status: FileStatus,
    /// Per-path problem recorded during scanning, hashing or packaging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64, mod_time: DateTime<Utc>) -> Self {
        let path = path.into();
        let name = file_name(&path).to_string();
        Self {
            path,
            name,
            size,
            mod_time,
            content_hash: String::new(),
            status: FileStatus::Unchanged,
            error: None,
        }
    }

    pub fn has_hash(&self) -> bool {
        !self.content_hash.is_empty()
    }

    /// Size and modification time both match `other`.
    pub fn same_metadata(&self, other: &FileInfo) -> bool {
        self.size == other.size && self.mod_time == other.mod_time
    }
}

/// Aggregated metadata for a directory. Counts are recursive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirInfo {
    pub path: String,
    pub name: String,
    pub mod_time: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
}

impl DirInfo {
    pub fn new(path: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        let path = path.into();
        let name = file_name(&path).to_string();
        Self {
            path,
            name,
            mod_time,
            file_count: 0,
            total_size: 0,
        }
    }
}

/// Durable record of an episode's state as of its last backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub series_id: String,
    pub episode_id: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileInfo>,
    #[serde(default)]
    pub directories: BTreeMap<String, DirInfo>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Derived index: content hash -> one path holding that content
    #[serde(default)]
    pub hash_to_file: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(series_id: impl Into<String>, episode_id: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            created_at: Utc::now(),
            series_id: series_id.into(),
            episode_id: episode_id.into(),
            files: BTreeMap::new(),
            directories: BTreeMap::new(),
            metadata: BTreeMap::new(),
            hash_to_file: BTreeMap::new(),
        }
    }

    /// Recompute `hash_to_file` from `files`.
    ///
    /// A path with its own stored copy is preferred over a deduplicated
    /// one. Within each group paths are visited in ascending order, so the
    /// lexicographically greatest path is the one recorded.
    pub fn rebuild_hash_index(&mut self) {
        let links = self.deduplicated_links();
        self.hash_to_file.clear();
        for linked in [true, false] {
            for (path, file) in &self.files {
                if file.has_hash() && links.contains_key(path) == linked {
                    self.hash_to_file.insert(file.content_hash.clone(), path.clone());
                }
            }
        }
    }

    /// Deduplicated paths and the path each was linked to when recorded
    pub fn deduplicated_links(&self) -> BTreeMap<String, String> {
        self.metadata
            .get(DEDUPLICATED_KEY)
            .and_then(serde_json::Value::as_object)
            .map(|links| {
                links
                    .iter()
                    .filter_map(|(path, holder)| Some((path.clone(), holder.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every indexed hash points at a file that carries that hash, and every
    /// hashed file's content is indexed.
    pub fn hash_index_is_consistent(&self) -> bool {
        let indexed_ok = self.hash_to_file.iter().all(|(hash, path)| {
            self.files
                .get(path)
                .is_some_and(|file| &file.content_hash == hash)
        });
        let covered = self
            .files
            .values()
            .filter(|file| file.has_hash())
            .all(|file| self.hash_to_file.contains_key(&file.content_hash));
        indexed_ok && covered
    }

    /// Path of some file with the given content, if any.
    pub fn path_for_hash(&self, hash: &str) -> Option<&str> {
        self.hash_to_file.get(hash).map(String::as_str)
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Major version of the schema matches what this engine writes.
    pub fn is_compatible_version(&self) -> bool {
        major(&self.version) == major(MANIFEST_VERSION)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Last component of a slash-normalized relative path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a slash-normalized relative path; `None` at the top level.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}
