//! Episode directory traversal.
//!
//! Produces `FileInfo` and `DirInfo` records for everything beneath an
//! episode root, keyed by slash-normalized relative paths. Hashing is not
//! done here; the differ hashes only the files that need comparing.
//!
//! Symlink policy: without `follow_links`, a symlink to a file is recorded
//! as a file carrying its target's size and content, a symlink to a
//! directory is skipped and a dangling symlink is reported as an issue.
//! With `follow_links`, loops are reported as issues instead of being walked.

use crate::config::ScanConfig;
use crate::manifest::{parent_path, DirInfo, FileInfo};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Path components excluded by exact name
    pub exclude_patterns: Vec<String>,

    /// Include entries whose name starts with a dot
    pub include_hidden: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for WalkOptions {
    fn from(config: &ScanConfig) -> Self {
        Self {
            follow_links: config.follow_links,
            max_depth: None,
            exclude_patterns: config.exclude_patterns.clone(),
            include_hidden: config.include_hidden,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanIssueKind {
    Unreadable,
    PermissionDenied,
    SymlinkLoop,
    BrokenSymlink,
    Metadata,
}

/// A path that could not be scanned or hashed. Never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanIssue {
    pub path: String,
    pub kind: ScanIssueKind,
    pub message: String,
}

impl ScanIssue {
    pub fn new(path: impl Into<String>, kind: ScanIssueKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(path: impl Into<String>, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ScanIssueKind::PermissionDenied,
            _ => ScanIssueKind::Unreadable,
        };
        Self::new(path, kind, err.to_string())
    }
}

/// Everything found beneath an episode root
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Absolute root that was scanned
    pub root: PathBuf,

    pub files: BTreeMap<String, FileInfo>,

    pub directories: BTreeMap<String, DirInfo>,

    /// Per-path problems; the scan continued past each of them
    pub issues: Vec<ScanIssue>,
}

impl ScanResult {
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Absolute path of a relative key
    pub fn absolute(&self, relative: &str) -> PathBuf {
        absolute_path(&self.root, relative)
    }
}

/// Join a slash-normalized relative key onto a root.
pub fn absolute_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Convert a path under `root` into its slash-normalized relative key.
pub fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Scan an episode root.
///
/// # Returns
/// * `Ok(ScanResult)` - All files and directories, plus per-path issues
/// * `Err(EngineError::Scan)` - If the root itself is missing or unreadable
pub fn scan_directory(root: &Path, options: &WalkOptions) -> Result<ScanResult> {
    scan_directory_with_callback(root, options, &CancellationToken::new(), |_| {})
}

/// Scan an episode root with a callback for each file (for progress reporting).
///
/// `cancel` is checked before every entry; a cancelled walk returns
/// `EngineError::Cancelled` and discards what was collected.
pub fn scan_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    cancel: &CancellationToken,
    mut callback: F,
) -> Result<ScanResult>
where
    F: FnMut(&FileInfo),
{
    let root_metadata = std::fs::metadata(root).map_err(|e| EngineError::Scan {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !root_metadata.is_dir() {
        return Err(EngineError::Scan {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut files = BTreeMap::new();
    let mut directories = BTreeMap::new();
    let mut issues = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1);

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let entries = walker
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, options));

    for entry in entries {
        if cancel.is_cancelled() {
            debug!("Scan of {} cancelled after {} files", root.display(), files.len());
            return Err(EngineError::Cancelled { processed_files: 0 });
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.depth() == 0 && err.loop_ancestor().is_none() {
                    return Err(EngineError::Scan {
                        path: root.to_path_buf(),
                        reason: err.to_string(),
                    });
                }
                let issue = issue_from_walk_error(root, &err);
                warn!("Skipping {}: {}", issue.path, issue.message);
                issues.push(issue);
                continue;
            }
        };

        let key = relative_key(root, entry.path());

        if entry.file_type().is_dir() {
            let mod_time = entry
                .metadata()
                .ok()
                .map(|m| modified_time(&m))
                .unwrap_or(DateTime::UNIX_EPOCH);
            directories.insert(key.clone(), DirInfo::new(key, mod_time));
            continue;
        }

        let metadata = if entry.path_is_symlink() && !options.follow_links {
            match std::fs::metadata(entry.path()) {
                Ok(resolved) if resolved.is_dir() => {
                    debug!("Skipping directory symlink: {}", key);
                    continue;
                }
                Ok(resolved) => resolved,
                Err(e) => {
                    issues.push(ScanIssue::new(
                        key,
                        ScanIssueKind::BrokenSymlink,
                        e.to_string(),
                    ));
                    continue;
                }
            }
        } else {
            match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    issues.push(ScanIssue::new(key, ScanIssueKind::Metadata, e.to_string()));
                    continue;
                }
            }
        };

        if !metadata.is_file() {
            debug!("Skipping special file: {}", key);
            continue;
        }

        let file = FileInfo::new(key.clone(), metadata.len(), modified_time(&metadata));
        callback(&file);
        files.insert(key, file);
    }

    aggregate_directories(&files, &mut directories);

    Ok(ScanResult {
        root: root.to_path_buf(),
        files,
        directories,
        issues,
    })
}

/// Roll file counts and sizes up into every ancestor directory.
fn aggregate_directories(
    files: &BTreeMap<String, FileInfo>,
    directories: &mut BTreeMap<String, DirInfo>,
) {
    for file in files.values() {
        let mut current = parent_path(&file.path);
        while let Some(dir_path) = current {
            if let Some(dir) = directories.get_mut(dir_path) {
                dir.file_count += 1;
                dir.total_size += file.size;
            }
            current = parent_path(dir_path);
        }
    }
}

fn modified_time(metadata: &Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn issue_from_walk_error(root: &Path, err: &walkdir::Error) -> ScanIssue {
    let path = err
        .path()
        .map(|p| relative_key(root, p))
        .unwrap_or_default();

    if let Some(ancestor) = err.loop_ancestor() {
        return ScanIssue::new(
            path,
            ScanIssueKind::SymlinkLoop,
            format!("symlink loop back to {}", ancestor.display()),
        );
    }

    match err.io_error() {
        Some(io_err) => ScanIssue::from_io(path, io_err),
        None => ScanIssue::new(path, ScanIssueKind::Unreadable, err.to_string()),
    }
}

/// Check if a directory entry should be excluded by name
fn should_exclude(entry: &DirEntry, options: &WalkOptions) -> bool {
    if entry.depth() == 0 {
        return false;
    }

    let file_name = entry.file_name().to_string_lossy();

    if !options.include_hidden && file_name.starts_with('.') {
        return true;
    }

    options
        .exclude_patterns
        .iter()
        .any(|pattern| file_name == pattern.as_str())
}
