//! Copies new and modified files into the destination.
//!
//! Each file is streamed into `<name>.partial`, hashed on the way, and
//! renamed into place once complete. Workers draw permits from a weighted
//! semaphore so many small files run side by side while huge files run
//! alone.

use crate::fs::hasher::{hash_file, ContentHasher};
use crate::manifest::FileInfo;
use crate::transfer::progress::{ProgressEvent, ProgressSender};
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::{EngineError, Result};
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reference budget the weight table is written against
const REFERENCE_BUDGET: u64 = 64;

/// Returns the number of semaphore permits a file should acquire based on its size.
///
/// | File size       | Permits (budget 64) | Effective concurrency |
/// |-----------------|---------------------|----------------------|
/// | < 10 MB         | 1                   | 64                   |
/// | 10 – 100 MB     | 2                   | 32                   |
/// | 100 – 500 MB    | 16                  | 4                    |
/// | 500 MB – 1 GB   | 32                  | 2                    |
/// | > 1 GB          | 64                  | 1                    |
///
/// Other budgets scale the table proportionally, never below one permit.
pub fn concurrency_weight(file_size: u64, budget: u32) -> u32 {
    let weight: u64 = match file_size {
        0..=10_485_759 => 1,
        10_485_760..=104_857_599 => 2,
        104_857_600..=524_287_999 => 16,
        524_288_000..=1_073_741_823 => 32,
        _ => 64,
    };
    let budget = u64::from(budget.max(1));
    let scaled = (weight * budget / REFERENCE_BUDGET).clamp(1, budget);
    scaled as u32
}

/// One file to package
#[derive(Debug, Clone)]
pub struct PackageJob {
    pub file: FileInfo,
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct PackagingOptions {
    /// Total permits of the weighted semaphore
    pub io_budget: u32,

    /// Content hash → path whose stored copy survives this run; matching content is not copied
    pub dedup_index: Option<Arc<BTreeMap<String, String>>>,
}

/// What happened to a single file
#[derive(Debug)]
pub enum Packaged {
    /// Written to the destination; hash and size reflect what was copied
    Copied(FileInfo),

    /// Content already stored under `existing` in the prior manifest
    Deduplicated { file: FileInfo, existing: String },

    /// The source could not be read; nothing was written
    SourceFailed { file: FileInfo, error: io::Error },
}

impl Packaged {
    pub fn path(&self) -> &str {
        match self {
            Packaged::Copied(file)
            | Packaged::Deduplicated { file, .. }
            | Packaged::SourceFailed { file, .. } => &file.path,
        }
    }

    fn succeeded(&self) -> bool {
        !matches!(self, Packaged::SourceFailed { .. })
    }
}

#[derive(Debug, Default)]
pub struct PackagingReport {
    pub packaged: Vec<Packaged>,

    /// First destination failure; remaining workers were stopped
    pub write_error: Option<EngineError>,
}

impl PackagingReport {
    /// Files copied or deduplicated
    pub fn processed_files(&self) -> usize {
        self.packaged.iter().filter(|p| p.succeeded()).count()
    }
}

/// Package every job on the weighted worker pool.
///
/// `cancel` is checked before each file; a file already being copied is
/// finished and renamed first. A destination write failure stops the
/// remaining workers without cancelling `cancel` itself.
pub async fn package_files(
    jobs: Vec<PackageJob>,
    options: &PackagingOptions,
    cancel: &CancellationToken,
    progress: &ProgressSender,
) -> PackagingReport {
    let budget = options.io_budget.max(1);
    let semaphore = Arc::new(Semaphore::new(budget as usize));
    let abort = cancel.child_token();

    info!(
        "Starting parallel file processing: {} files, adaptive concurrency (budget: {})",
        jobs.len(),
        budget
    );

    let mut handles = Vec::with_capacity(jobs.len());

    for job in jobs {
        let sem = Arc::clone(&semaphore);
        let abort = abort.clone();
        let progress = progress.clone();
        let dedup_index = options.dedup_index.clone();

        let handle = tokio::spawn(async move {
            if abort.is_cancelled() {
                return None;
            }

            let weight = concurrency_weight(job.file.size, budget);
            let permit = tokio::select! {
                permit = sem.acquire_many_owned(weight) => permit.ok()?,
                _ = abort.cancelled() => return None,
            };

            if abort.is_cancelled() {
                return None;
            }

            let result = package_one(job, dedup_index.as_deref(), &progress).await;
            drop(permit);

            if result.is_err() {
                abort.cancel();
            }
            let _ = progress.send(ProgressEvent::FileDone);
            Some(result)
        });

        handles.push(handle);
    }

    let mut report = PackagingReport::default();
    for handle in handles {
        match handle.await {
            Ok(Some(Ok(packaged))) => report.packaged.push(packaged),
            Ok(Some(Err(e))) => {
                error!("{}", e);
                if report.write_error.is_none() {
                    report.write_error = Some(e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Packaging worker failed: {}", e),
        }
    }

    report
}

async fn package_one(
    job: PackageJob,
    dedup_index: Option<&BTreeMap<String, String>>,
    progress: &ProgressSender,
) -> Result<Packaged> {
    let PackageJob {
        mut file,
        source,
        target,
    } = job;

    if let Some(index) = dedup_index {
        if !file.has_hash() {
            let path = source.clone();
            let hashed = tokio::task::spawn_blocking(move || hash_file(&path))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));
            match hashed {
                Ok(hash) => file.content_hash = hash,
                Err(error) => {
                    warn!("Skipping unreadable source {}: {}", source.display(), error);
                    return Ok(Packaged::SourceFailed { file, error });
                }
            }
        }

        if let Some(existing) = index.get(&file.content_hash) {
            debug!("{} has the same content as {}, not copying", file.path, existing);
            let _ = progress.send(ProgressEvent::Bytes(file.size));
            return Ok(Packaged::Deduplicated {
                existing: existing.clone(),
                file,
            });
        }
    }

    match copy_file(&source, &target, progress).await {
        Ok((hash, bytes)) => {
            debug!("Copied {} bytes: {}", bytes, file.path);
            file.content_hash = hash;
            file.size = bytes;
            file.error = None;
            Ok(Packaged::Copied(file))
        }
        Err(CopyError::Source(error)) => {
            warn!("Skipping unreadable source {}: {}", source.display(), error);
            Ok(Packaged::SourceFailed { file, error })
        }
        Err(CopyError::Destination(error)) => Err(EngineError::Write {
            path: target,
            source: error,
        }),
    }
}

enum CopyError {
    Source(io::Error),
    Destination(io::Error),
}

fn partial_path(target: &Path) -> PathBuf {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Copy `source` to `target` via a `.partial` sibling, returning the content
/// hash and the number of bytes copied.
async fn copy_file(
    source: &Path,
    target: &Path,
    progress: &ProgressSender,
) -> std::result::Result<(String, u64), CopyError> {
    let reader = tokio::fs::File::open(source)
        .await
        .map_err(CopyError::Source)?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(CopyError::Destination)?;
    }

    let partial = partial_path(target);
    let copied = match stream_into(reader, &partial, progress).await {
        Ok(copied) => copied,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(CopyError::Destination(e));
    }

    Ok(copied)
}

async fn stream_into(
    reader: tokio::fs::File,
    partial: &Path,
    progress: &ProgressSender,
) -> std::result::Result<(String, u64), CopyError> {
    let mut writer = tokio::fs::File::create(partial)
        .await
        .map_err(CopyError::Destination)?;

    let tx = progress.clone();
    let callback: ProgressCallback = Arc::new(move |delta| {
        let _ = tx.send(ProgressEvent::Bytes(delta));
    });

    let mut stream = ProgressStream::new(ReaderStream::new(reader), callback);
    let mut hasher = ContentHasher::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(CopyError::Source)?;
        hasher.update(&chunk);
        writer
            .write_all(&chunk)
            .await
            .map_err(CopyError::Destination)?;
    }

    writer.flush().await.map_err(CopyError::Destination)?;
    writer.sync_all().await.map_err(CopyError::Destination)?;

    Ok((hasher.finalize(), stream.bytes_transferred()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::hasher::hash_bytes;
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn job(root: &Path, dest: &Path, path: &str, body: &[u8]) -> PackageJob {
        let source = root.join(path);
        if let Some(parent) = source.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&source, body).unwrap();
        PackageJob {
            file: FileInfo::new(path, body.len() as u64, Utc::now()),
            source,
            target: dest.join(path),
        }
    }

    #[test]
    fn test_concurrency_weight() {
        assert_eq!(concurrency_weight(0, 64), 1);
        assert_eq!(concurrency_weight(5_000_000, 64), 1);
        assert_eq!(concurrency_weight(50_000_000, 64), 2);
        assert_eq!(concurrency_weight(200_000_000, 64), 16);
        assert_eq!(concurrency_weight(800_000_000, 64), 32);
        assert_eq!(concurrency_weight(2_000_000_000, 64), 64);
    }

    #[test]
    fn test_concurrency_weight_scales_with_budget() {
        assert_eq!(concurrency_weight(2_000_000_000, 8), 8);
        assert_eq!(concurrency_weight(200_000_000, 8), 2);
        assert_eq!(concurrency_weight(50_000_000, 8), 1);
        assert_eq!(concurrency_weight(2_000_000_000, 1), 1);
        assert_eq!(concurrency_weight(2_000_000_000, 0), 1);
    }

    #[tokio::test]
    async fn test_copies_and_hashes() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let jobs = vec![
            job(src.path(), dest.path(), "a.txt", b"alpha"),
            job(src.path(), dest.path(), "nested/deep/b.txt", b"bravo!"),
        ];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = PackagingOptions {
            io_budget: 4,
            dedup_index: None,
        };

        let report = package_files(jobs, &options, &CancellationToken::new(), &tx).await;
        drop(tx);

        assert!(report.write_error.is_none());
        assert_eq!(report.processed_files(), 2);
        assert_eq!(std::fs::read(dest.path().join("nested/deep/b.txt")).unwrap(), b"bravo!");
        assert!(!dest.path().join("a.txt.partial").exists());

        for packaged in &report.packaged {
            let Packaged::Copied(file) = packaged else {
                panic!("expected a copy");
            };
            let body = std::fs::read(dest.path().join(&file.path)).unwrap();
            assert_eq!(file.content_hash, hash_bytes(&body));
        }

        let mut bytes = 0;
        let mut done = 0;
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Bytes(n) => bytes += n,
                ProgressEvent::FileDone => done += 1,
                _ => {}
            }
        }
        assert_eq!(bytes, 11);
        assert_eq!(done, 2);
    }

    #[tokio::test]
    async fn test_deduplicates_known_content() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let jobs = vec![
            job(src.path(), dest.path(), "copy-of-intro.wav", b"intro"),
            job(src.path(), dest.path(), "fresh.wav", b"fresh"),
        ];
        let mut index = BTreeMap::new();
        index.insert(hash_bytes(b"intro"), "intro.wav".to_string());
        let options = PackagingOptions {
            io_budget: 2,
            dedup_index: Some(Arc::new(index)),
        };
        let (tx, _rx) = mpsc::unbounded_channel();

        let report = package_files(jobs, &options, &CancellationToken::new(), &tx).await;

        assert_eq!(report.processed_files(), 2);
        assert!(!dest.path().join("copy-of-intro.wav").exists());
        assert!(dest.path().join("fresh.wav").exists());
        assert!(report.packaged.iter().any(|p| matches!(
            p,
            Packaged::Deduplicated { existing, .. } if existing == "intro.wav"
        )));
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let good = job(src.path(), dest.path(), "good.txt", b"ok");
        let missing = PackageJob {
            file: FileInfo::new("missing.txt", 3, Utc::now()),
            source: src.path().join("missing.txt"),
            target: dest.path().join("missing.txt"),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = PackagingOptions {
            io_budget: 1,
            dedup_index: None,
        };

        let report = package_files(vec![good, missing], &options, &CancellationToken::new(), &tx).await;

        assert!(report.write_error.is_none());
        assert_eq!(report.processed_files(), 1);
        assert!(report
            .packaged
            .iter()
            .any(|p| matches!(p, Packaged::SourceFailed { .. }) && p.path() == "missing.txt"));
    }

    #[tokio::test]
    async fn test_destination_failure_is_write_error() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        // A regular file where a directory is needed
        std::fs::write(dest.path().join("blocked"), b"").unwrap();
        let jobs = vec![job(src.path(), &dest.path().join("blocked"), "a.txt", b"data")];
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = PackagingOptions {
            io_budget: 1,
            dedup_index: None,
        };

        let report = package_files(jobs, &options, &CancellationToken::new(), &tx).await;

        assert!(matches!(report.write_error, Some(EngineError::Write { .. })));
        assert_eq!(report.processed_files(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_copies_nothing() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let jobs = vec![job(src.path(), dest.path(), "a.txt", b"data")];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();

        let report = package_files(jobs, &PackagingOptions::default(), &cancel, &tx).await;

        assert!(report.packaged.is_empty());
        assert!(!dest.path().join("a.txt").exists());
    }
}
