//! Scan-vs-manifest comparison.
//!
//! Classification is path based (exact, case-sensitive keys):
//!
//! | Prior manifest | Current scan | Metadata | Result |
//! |----------------|--------------|----------|--------|
//! | absent         | present      | -        | new |
//! | present        | present      | equal    | unchanged (re-hashed in verify mode) |
//! | present        | present      | differs  | hash decides: modified / unchanged |
//! | present        | absent       | -        | deleted |
//!
//! Only files whose metadata changed (or every prior file, in verify mode)
//! are hashed, and that hashing runs on a bounded pool.

use crate::config::{DiffMode, EngineConfig};
use crate::fs::hasher::hash_file;
use crate::fs::walker::{absolute_path, ScanIssue, ScanResult};
use crate::manifest::{DirInfo, FileInfo, FileStatus, Manifest};
use crate::transfer::progress::{ProgressEvent, ProgressSender};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aggregate change counts for a prepared backup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    pub new_count: usize,
    pub modified_count: usize,
    pub deleted_count: usize,
    /// Size of every current (non-deleted) file
    pub total_size: u64,
}

/// A file that must be hashed before it can be classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJob {
    pub path: String,
    pub size: u64,
}

/// Result of diffing a scan against the prior manifest
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Current files, classified; hashes filled where known
    pub files: BTreeMap<String, FileInfo>,

    /// Files of the prior manifest that no longer exist
    pub deleted: BTreeMap<String, FileInfo>,

    /// Current directories
    pub directories: BTreeMap<String, DirInfo>,

    pub change_info: ChangeInfo,

    /// Scan issues plus hashing failures
    pub issues: Vec<ScanIssue>,
}

impl DiffOutcome {
    /// Files whose content must be packaged (new or modified)
    pub fn files_to_package(&self) -> impl Iterator<Item = &FileInfo> {
        self.files
            .values()
            .filter(|f| matches!(f.status, FileStatus::New | FileStatus::Modified))
    }

    /// Current and deleted files together, for display
    pub fn all_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values().chain(self.deleted.values())
    }

    pub fn has_changes(&self) -> bool {
        let c = &self.change_info;
        c.new_count + c.modified_count + c.deleted_count > 0
    }
}

/// Tally statuses into a `ChangeInfo`
pub fn tally<'a>(files: impl IntoIterator<Item = &'a FileInfo>) -> ChangeInfo {
    let mut info = ChangeInfo::default();
    for file in files {
        match file.status {
            FileStatus::New => info.new_count += 1,
            FileStatus::Modified => info.modified_count += 1,
            FileStatus::Deleted => info.deleted_count += 1,
            FileStatus::Unchanged => {}
        }
        if file.status != FileStatus::Deleted {
            info.total_size += file.size;
        }
    }
    info
}

/// Files that need a fresh hash to be classified
pub fn paths_needing_hash(scan: &ScanResult, prior: Option<&Manifest>, mode: DiffMode) -> Vec<HashJob> {
    let Some(prior) = prior else {
        return Vec::new();
    };

    scan.files
        .values()
        .filter(|file| match prior.files.get(&file.path) {
            None => false,
            Some(previous) => {
                mode == DiffMode::Verify || !file.same_metadata(previous) || !previous.has_hash()
            }
        })
        .map(|file| HashJob {
            path: file.path.clone(),
            size: file.size,
        })
        .collect()
}

/// Classify every path. `hash_of` is asked only for paths returned by
/// `paths_needing_hash`.
pub fn classify<F>(scan: &ScanResult, prior: Option<&Manifest>, mode: DiffMode, mut hash_of: F) -> DiffOutcome
where
    F: FnMut(&str) -> io::Result<String>,
{
    let mut files = BTreeMap::new();
    let mut issues = scan.issues.clone();

    for (path, scanned) in &scan.files {
        let mut file = scanned.clone();

        match prior.and_then(|m| m.files.get(path)) {
            None => {
                file.status = FileStatus::New;
            }
            Some(previous) => {
                let needs_hash = mode == DiffMode::Verify
                    || !file.same_metadata(previous)
                    || !previous.has_hash();

                if !needs_hash {
                    file.status = FileStatus::Unchanged;
                    file.content_hash = previous.content_hash.clone();
                } else {
                    match hash_of(path) {
                        Ok(hash) => {
                            file.status = if previous.has_hash() {
                                if previous.content_hash == hash {
                                    FileStatus::Unchanged
                                } else {
                                    FileStatus::Modified
                                }
                            } else if file.same_metadata(previous) {
                                FileStatus::Unchanged
                            } else {
                                FileStatus::Modified
                            };
                            file.content_hash = hash;
                        }
                        Err(e) => {
                            warn!("Could not hash {}: {}", path, e);
                            file.status = FileStatus::Modified;
                            file.error = Some(e.to_string());
                            issues.push(ScanIssue::from_io(path.clone(), &e));
                        }
                    }
                }
            }
        }

        files.insert(path.clone(), file);
    }

    let deleted: BTreeMap<String, FileInfo> = prior
        .map(|m| {
            m.files
                .iter()
                .filter(|(path, _)| !scan.files.contains_key(*path))
                .map(|(path, previous)| {
                    let mut file = previous.clone();
                    file.status = FileStatus::Deleted;
                    file.error = None;
                    (path.clone(), file)
                })
                .collect()
        })
        .unwrap_or_default();

    let change_info = tally(files.values().chain(deleted.values()));

    DiffOutcome {
        files,
        deleted,
        directories: scan.directories.clone(),
        change_info,
        issues,
    }
}

/// Hash files on a bounded pool of blocking workers.
///
/// Cancellation is checked before each file; a file already being hashed
/// finishes first.
pub async fn hash_files(
    root: &Path,
    jobs: Vec<HashJob>,
    workers: usize,
    cancel: &CancellationToken,
    progress: Option<&ProgressSender>,
) -> Result<HashMap<String, io::Result<String>>> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(jobs.len());

    for job in jobs {
        let sem = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let progress = progress.cloned();
        let absolute = absolute_path(root, &job.path);

        let handle = tokio::spawn(async move {
            if cancel.is_cancelled() {
                return None;
            }

            let permit = tokio::select! {
                permit = sem.acquire_owned() => permit.ok()?,
                _ = cancel.cancelled() => return None,
            };

            if cancel.is_cancelled() {
                return None;
            }

            let result = tokio::task::spawn_blocking(move || hash_file(&absolute))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));
            drop(permit);

            if let Some(tx) = &progress {
                let _ = tx.send(ProgressEvent::Bytes(job.size));
                let _ = tx.send(ProgressEvent::FileDone);
            }

            Some((job.path, result))
        });

        handles.push(handle);
    }

    let mut hashes = HashMap::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Some((path, result))) => {
                hashes.insert(path, result);
            }
            Ok(None) => {}
            Err(e) => warn!("Hash worker failed: {}", e),
        }
    }

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled {
            processed_files: hashes.len(),
        });
    }

    Ok(hashes)
}

/// Compares scans against prior manifests
#[derive(Debug, Clone)]
pub struct Differ {
    mode: DiffMode,
    hash_workers: usize,
}

impl Differ {
    pub fn new(mode: DiffMode, hash_workers: usize) -> Self {
        Self {
            mode,
            hash_workers: hash_workers.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.diff.mode, config.packaging.hash_workers)
    }

    pub fn mode(&self) -> DiffMode {
        self.mode
    }

    /// Sequential diff on the calling thread
    pub fn diff_blocking(&self, scan: &ScanResult, prior: Option<&Manifest>) -> DiffOutcome {
        classify(scan, prior, self.mode, |path| hash_file(&scan.absolute(path)))
    }

    /// Diff with hashing fanned out over the worker pool
    pub async fn diff(
        &self,
        scan: &ScanResult,
        prior: Option<&Manifest>,
        cancel: &CancellationToken,
        progress: Option<&ProgressSender>,
    ) -> Result<DiffOutcome> {
        let jobs = paths_needing_hash(scan, prior, self.mode);
        let hash_bytes: u64 = jobs.iter().map(|j| j.size).sum();
        debug!(
            "Hashing {} file(s), {} bytes ({:?} mode, {} workers)",
            jobs.len(),
            hash_bytes,
            self.mode,
            self.hash_workers
        );

        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent::phase("hashing", jobs.len(), hash_bytes));
        }

        let mut hashes = hash_files(&scan.root, jobs, self.hash_workers, cancel, progress).await?;

        let outcome = classify(scan, prior, self.mode, |path| {
            hashes
                .remove(path)
                .unwrap_or_else(|| Err(io::Error::other("file was not hashed")))
        });

        let c = &outcome.change_info;
        info!(
            "Diff complete: {} new, {} modified, {} deleted, {} bytes current",
            c.new_count, c.modified_count, c.deleted_count, c.total_size
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use std::path::PathBuf;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn scan_of(files: &[(&str, u64, i64)]) -> ScanResult {
        ScanResult {
            root: PathBuf::from("/episode"),
            files: files
                .iter()
                .map(|(path, size, mtime)| (path.to_string(), FileInfo::new(*path, *size, at(*mtime))))
                .collect(),
            directories: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    fn manifest_of(files: &[(&str, u64, i64, &str)]) -> Manifest {
        let mut manifest = Manifest::new("s", "e");
        for (path, size, mtime, hash) in files {
            let mut file = FileInfo::new(*path, *size, at(*mtime));
            file.content_hash = hash.to_string();
            manifest.files.insert(path.to_string(), file);
        }
        manifest.rebuild_hash_index();
        manifest
    }

    fn hashes(pairs: &[(&str, &str)]) -> impl FnMut(&str) -> io::Result<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect();
        move |path: &str| {
            map.get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }
    }

    #[test]
    fn test_first_backup_everything_new() {
        let scan = scan_of(&[("a.txt", 10, 1), ("dir/b.txt", 20, 1)]);
        let outcome = classify(&scan, None, DiffMode::Fast, |_| panic!("no hashing expected"));

        assert!(outcome.files.values().all(|f| f.status == FileStatus::New));
        assert_eq!(
            outcome.change_info,
            ChangeInfo {
                new_count: 2,
                modified_count: 0,
                deleted_count: 0,
                total_size: 30
            }
        );
        assert!(paths_needing_hash(&scan, None, DiffMode::Fast).is_empty());
    }

    #[test]
    fn test_unchanged_metadata_skips_hashing() {
        let scan = scan_of(&[("a.txt", 10, 5), ("b.txt", 4, 5)]);
        let prior = manifest_of(&[("a.txt", 10, 5, "h-a"), ("b.txt", 4, 5, "h-b")]);

        let outcome = classify(&scan, Some(&prior), DiffMode::Fast, |_| panic!("no hashing expected"));

        assert!(outcome.files.values().all(|f| f.status == FileStatus::Unchanged));
        assert_eq!(outcome.files["a.txt"].content_hash, "h-a");
        assert_eq!(
            outcome.change_info,
            ChangeInfo {
                new_count: 0,
                modified_count: 0,
                deleted_count: 0,
                total_size: 14
            }
        );
    }

    #[test]
    fn test_metadata_change_resolved_by_hash() {
        let scan = scan_of(&[("touched.txt", 10, 99), ("edited.txt", 12, 99)]);
        let prior = manifest_of(&[("touched.txt", 10, 5, "same"), ("edited.txt", 10, 5, "old")]);

        let jobs = paths_needing_hash(&scan, Some(&prior), DiffMode::Fast);
        assert_eq!(jobs.len(), 2);

        let outcome = classify(
            &scan,
            Some(&prior),
            DiffMode::Fast,
            hashes(&[("touched.txt", "same"), ("edited.txt", "new")]),
        );

        assert_eq!(outcome.files["touched.txt"].status, FileStatus::Unchanged);
        assert_eq!(outcome.files["edited.txt"].status, FileStatus::Modified);
        assert_eq!(outcome.files["edited.txt"].content_hash, "new");
        assert_eq!(outcome.change_info.modified_count, 1);
    }

    #[test]
    fn test_verify_mode_catches_silent_change() {
        let scan = scan_of(&[("a.txt", 10, 5)]);
        let prior = manifest_of(&[("a.txt", 10, 5, "before")]);

        let fast = classify(&scan, Some(&prior), DiffMode::Fast, |_| panic!("no hashing expected"));
        assert_eq!(fast.files["a.txt"].status, FileStatus::Unchanged);

        assert_eq!(paths_needing_hash(&scan, Some(&prior), DiffMode::Verify).len(), 1);
        let verified = classify(&scan, Some(&prior), DiffMode::Verify, hashes(&[("a.txt", "after")]));
        assert_eq!(verified.files["a.txt"].status, FileStatus::Modified);
    }

    #[test]
    fn test_deleted_and_renamed() {
        let scan = scan_of(&[("renamed.txt", 10, 5)]);
        let prior = manifest_of(&[("original.txt", 10, 5, "content")]);

        let outcome = classify(&scan, Some(&prior), DiffMode::Fast, |_| panic!("no hashing expected"));

        assert_eq!(outcome.files["renamed.txt"].status, FileStatus::New);
        assert_eq!(outcome.deleted["original.txt"].status, FileStatus::Deleted);
        assert_eq!(outcome.deleted["original.txt"].content_hash, "content");
        assert_eq!(outcome.change_info.new_count, 1);
        assert_eq!(outcome.change_info.deleted_count, 1);
        assert_eq!(outcome.change_info.total_size, 10);
        assert_eq!(outcome.all_files().count(), 2);
    }

    #[test]
    fn test_paths_are_case_sensitive() {
        let scan = scan_of(&[("Readme.md", 3, 1)]);
        let prior = manifest_of(&[("README.md", 3, 1, "h")]);

        let outcome = classify(&scan, Some(&prior), DiffMode::Fast, |_| panic!("no hashing expected"));
        assert_eq!(outcome.files["Readme.md"].status, FileStatus::New);
        assert!(outcome.deleted.contains_key("README.md"));
    }

    #[test]
    fn test_hash_failure_marks_modified_with_error() {
        let scan = scan_of(&[("locked.bin", 8, 9)]);
        let prior = manifest_of(&[("locked.bin", 4, 1, "old")]);

        let outcome = classify(&scan, Some(&prior), DiffMode::Fast, hashes(&[]));

        let file = &outcome.files["locked.bin"];
        assert_eq!(file.status, FileStatus::Modified);
        assert!(file.error.is_some());
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].path, "locked.bin");
    }

    #[test]
    fn test_tally_matches_statuses() {
        let scan = scan_of(&[("n.txt", 1, 1), ("m.txt", 2, 9), ("u.txt", 4, 1)]);
        let prior = manifest_of(&[("m.txt", 2, 1, "m0"), ("u.txt", 4, 1, "u0"), ("d.txt", 8, 1, "d0")]);

        let outcome = classify(&scan, Some(&prior), DiffMode::Fast, hashes(&[("m.txt", "m1")]));

        let recount = tally(outcome.all_files());
        assert_eq!(recount, outcome.change_info);
        assert_eq!(
            outcome.change_info,
            ChangeInfo {
                new_count: 1,
                modified_count: 1,
                deleted_count: 1,
                total_size: 7
            }
        );
        let to_package: Vec<&str> = outcome.files_to_package().map(|f| f.path.as_str()).collect();
        assert_eq!(to_package, vec!["m.txt", "n.txt"]);
    }

    #[tokio::test]
    async fn test_parallel_hashing_on_disk() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        for i in 0..12 {
            std::fs::write(temp_dir.path().join(format!("f{i}.txt")), format!("body {i}"))?;
        }
        let jobs: Vec<HashJob> = (0..12)
            .map(|i| HashJob {
                path: format!("f{i}.txt"),
                size: 6,
            })
            .chain(std::iter::once(HashJob {
                path: "missing.txt".into(),
                size: 0,
            }))
            .collect();

        let cancel = CancellationToken::new();
        let hashes = hash_files(temp_dir.path(), jobs, 3, &cancel, None).await?;

        assert_eq!(hashes.len(), 13);
        assert_eq!(
            hashes["f3.txt"].as_ref().unwrap(),
            &crate::fs::hasher::hash_bytes(b"body 3")
        );
        assert!(hashes["missing.txt"].is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_hashing_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let jobs = vec![HashJob {
            path: "a".into(),
            size: 1,
        }];

        let err = hash_files(Path::new("/episode"), jobs, 2, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { processed_files: 0 }));
    }
}
