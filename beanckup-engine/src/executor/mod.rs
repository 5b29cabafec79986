//! Backup task driver - runs scan → diff → package as one cancellable task.
//!
//! At most one task runs per driver. Progress flows from the workers to a
//! reporter task as events and out to callers as `TaskStatus` snapshots on a
//! `watch` channel. The new manifest is persisted only when the whole run
//! completes.

pub mod dedup;
pub mod packaging;
pub mod state;

pub use state::{TaskEvent, TaskPhase};

use crate::config::EngineConfig;
use crate::diff::{ChangeInfo, DiffOutcome, Differ};
use crate::fs::walker::{absolute_path, scan_directory_with_callback, ScanIssue, ScanResult, WalkOptions};
use crate::manifest::{FileStatus, Manifest, DEDUPLICATED_KEY};
use crate::repository::{Episode, EpisodeRepository, EpisodeStatus};
use crate::store::{validate_id, write_atomically, ManifestStore};
use crate::transfer::progress::{spawn_reporter, ProgressEvent, ProgressSender, TaskStatus};
use crate::tree::{build_tree, TreeNode};
use crate::utils::errors::{EngineError, Result};
use dedup::DedupPlan;
use packaging::{package_files, PackageJob, Packaged, PackagingOptions, PackagingReport};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which episode to examine and which prior manifest to diff against
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Episode root directory
    pub root: PathBuf,
    pub series_id: String,
    pub episode_id: String,

    /// Display name used when the episode is first registered
    pub episode_name: Option<String>,
}

impl PrepareRequest {
    pub fn new(root: impl Into<PathBuf>, series_id: impl Into<String>, episode_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            series_id: series_id.into(),
            episode_id: episode_id.into(),
            episode_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.episode_name = Some(name.into());
        self
    }

    /// Turn the preview into a full run writing under `destination`
    pub fn into_run(self, destination: impl Into<PathBuf>) -> RunRequest {
        RunRequest {
            source: self,
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: PrepareRequest,

    /// Files land in `<destination>/<episodeId>/<relative path>`
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPreparationResult {
    pub episodes: Vec<Episode>,
    pub file_tree: Vec<TreeNode>,
    pub change_info: ChangeInfo,

    /// Paths that could not be scanned or hashed
    pub warnings: Vec<ScanIssue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagingStats {
    pub copied_files: usize,
    pub copied_bytes: u64,
    pub deduplicated_files: usize,
    /// New or modified files whose source could not be read
    pub skipped_files: usize,
    pub unchanged_files: usize,
    pub deleted_files: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub episodes: Vec<Episode>,
    pub manifest: Manifest,
    pub stats: PackagingStats,
    pub warnings: Vec<ScanIssue>,
}

/// Handle to a started task. Awaiting `wait` consumes the result and
/// returns the driver to idle.
pub struct BackupTask<T> {
    driver: TaskDriver,
    handle: JoinHandle<Result<T>>,
}

impl<T> BackupTask<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<T> {
        let result = match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Backup task panicked: {}", e);
                Err(EngineError::TaskFailed {
                    processed_files: 0,
                    source: Box::new(EngineError::Io(io::Error::other(e.to_string()))),
                })
            }
        };
        self.driver.consume().await;
        result
    }
}

struct TaskSlot {
    phase: TaskPhase,
    cancel: Option<CancellationToken>,
}

struct DriverShared {
    config: EngineConfig,
    store: Arc<dyn ManifestStore>,
    repository: EpisodeRepository,
    status_tx: Arc<watch::Sender<TaskStatus>>,
    slot: Mutex<TaskSlot>,
}

/// Scan/diff working set of one run
struct Prepared {
    scan: ScanResult,
    prior: Option<Manifest>,
    outcome: DiffOutcome,
    prior_discarded: Option<String>,
}

/// Main backup driver
#[derive(Clone)]
pub struct TaskDriver {
    shared: Arc<DriverShared>,
}

impl TaskDriver {
    pub fn new(config: EngineConfig, store: Arc<dyn ManifestStore>) -> Self {
        Self::with_repository(config, store, EpisodeRepository::new())
    }

    pub fn with_repository(
        config: EngineConfig,
        store: Arc<dyn ManifestStore>,
        repository: EpisodeRepository,
    ) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::idle());
        Self {
            shared: Arc::new(DriverShared {
                config,
                store,
                repository,
                status_tx: Arc::new(status_tx),
                slot: Mutex::new(TaskSlot {
                    phase: TaskPhase::Idle,
                    cancel: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn repository(&self) -> &EpisodeRepository {
        &self.shared.repository
    }

    /// Latest published snapshot
    pub fn task_status(&self) -> TaskStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.shared.status_tx.subscribe()
    }

    pub async fn state(&self) -> TaskPhase {
        self.shared.slot.lock().await.phase
    }

    /// Request cooperative cancellation; false when nothing is running
    pub async fn cancel_task(&self) -> bool {
        let slot = self.shared.slot.lock().await;
        match (&slot.cancel, slot.phase.is_active()) {
            (Some(cancel), true) => {
                info!("Cancellation requested during {}", slot.phase);
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Scan and diff without packaging
    pub async fn prepare_backup(&self, request: PrepareRequest) -> Result<BackupPreparationResult> {
        self.start_prepare(request).await?.wait().await
    }

    pub async fn start_prepare(&self, request: PrepareRequest) -> Result<BackupTask<BackupPreparationResult>> {
        let cancel = self.begin().await?;
        let (progress, reporter) =
            spawn_reporter(Arc::clone(&self.shared.status_tx), &self.shared.config.progress);

        let driver = self.clone();
        let handle = tokio::spawn(async move {
            let result = driver.prepare_pipeline(&request, &cancel, &progress).await;
            driver.finish(&result, progress, reporter).await;
            result
        });

        Ok(BackupTask {
            driver: self.clone(),
            handle,
        })
    }

    /// Scan, diff and package, then persist the new manifest
    pub async fn run_backup(&self, request: RunRequest) -> Result<BackupResult> {
        self.start_backup(request).await?.wait().await
    }

    pub async fn start_backup(&self, request: RunRequest) -> Result<BackupTask<BackupResult>> {
        let cancel = self.begin().await?;
        let (progress, reporter) =
            spawn_reporter(Arc::clone(&self.shared.status_tx), &self.shared.config.progress);

        let driver = self.clone();
        let handle = tokio::spawn(async move {
            let result = driver.run_pipeline(&request, &cancel, &progress).await;
            driver.finish(&result, progress, reporter).await;
            driver.settle_episode(&request.source.episode_id, &result).await;

            result.map_err(|e| match e {
                e @ (EngineError::Cancelled { .. } | EngineError::TaskFailed { .. }) => e,
                other => EngineError::TaskFailed {
                    processed_files: 0,
                    source: Box::new(other),
                },
            })
        });

        Ok(BackupTask {
            driver: self.clone(),
            handle,
        })
    }

    async fn begin(&self) -> Result<CancellationToken> {
        let mut slot = self.shared.slot.lock().await;
        if slot.phase.is_active() {
            return Err(EngineError::TaskAlreadyRunning(slot.phase.to_string()));
        }
        if slot.phase.is_terminal() {
            debug!("Discarding unconsumed {} result", slot.phase);
            slot.phase = slot.phase.next(TaskEvent::Reset)?;
        }
        slot.phase = slot.phase.next(TaskEvent::Start)?;

        let cancel = CancellationToken::new();
        slot.cancel = Some(cancel.clone());

        self.shared.status_tx.send_replace(TaskStatus {
            is_running: true,
            current_phase: TaskPhase::Scanning.to_string(),
            ..TaskStatus::idle()
        });
        Ok(cancel)
    }

    async fn advance(&self, event: TaskEvent) -> Result<TaskPhase> {
        let mut slot = self.shared.slot.lock().await;
        let next = slot.phase.next(event)?;
        debug!("Task {} -> {}", slot.phase, next);
        slot.phase = next;
        Ok(next)
    }

    /// Record the terminal phase and flush the last snapshot
    async fn finish<T>(&self, result: &Result<T>, progress: ProgressSender, reporter: JoinHandle<()>) {
        let phase = {
            let mut slot = self.shared.slot.lock().await;
            let event = match result {
                Ok(_) => None,
                Err(e) if e.is_cancelled() => Some(TaskEvent::Cancel),
                Err(_) => Some(TaskEvent::Fail),
            };
            if let Some(event) = event {
                match slot.phase.next(event) {
                    Ok(next) => slot.phase = next,
                    Err(e) => warn!("{}", e),
                }
            }
            slot.cancel = None;
            slot.phase
        };

        match result {
            Ok(_) => info!("Task completed"),
            Err(e) if e.is_cancelled() => info!("{}", e),
            Err(e) => error!("Task failed: {}", e),
        }

        let _ = progress.send(ProgressEvent::Finish {
            label: phase.to_string(),
        });
        drop(progress);
        if let Err(e) = reporter.await {
            warn!("Progress reporter failed: {}", e);
        }
    }

    /// The caller took the result; go back to idle
    async fn consume(&self) {
        let mut slot = self.shared.slot.lock().await;
        if slot.phase.is_terminal() {
            slot.phase = TaskPhase::Idle;
        } else if slot.phase.is_active() {
            warn!("Task ended without a terminal state ({}), resetting", slot.phase);
            slot.phase = TaskPhase::Idle;
            slot.cancel = None;
        }
    }

    async fn register_episode(&self, request: &PrepareRequest) -> Episode {
        let name = request.episode_name.as_deref().unwrap_or(&request.episode_id);
        self.shared
            .repository
            .ensure(&request.episode_id, name, &request.series_id)
            .await
    }

    async fn settle_episode<T>(&self, episode_id: &str, result: &Result<T>) {
        let status = match result {
            Ok(_) => return,
            Err(e) if e.is_cancelled() => EpisodeStatus::Prepared,
            Err(_) => EpisodeStatus::Failed,
        };
        let repository = &self.shared.repository;
        if let Some(episode) = repository.get(episode_id).await {
            if episode.status == EpisodeStatus::BackingUp {
                if let Err(e) = repository.update_status(episode_id, status).await {
                    warn!("Could not update episode {}: {}", episode_id, e);
                }
            }
        }
    }

    async fn load_prior(&self, request: &PrepareRequest) -> Result<(Option<Manifest>, Option<String>)> {
        let store = Arc::clone(&self.shared.store);
        let series_id = request.series_id.clone();
        let episode_id = request.episode_id.clone();

        let loaded = tokio::task::spawn_blocking(move || store.load(&series_id, &episode_id))
            .await
            .map_err(|e| EngineError::Io(io::Error::other(e.to_string())))?;

        match loaded {
            Ok(prior) => Ok((prior, None)),
            Err(e @ EngineError::Diff { .. }) if self.shared.config.diff.accept_corrupt_manifest => {
                warn!("{}; treating this run as a first backup", e);
                Ok((None, Some(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    async fn scan_and_diff(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
        progress: &ProgressSender,
    ) -> Result<Prepared> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { processed_files: 0 });
        }

        info!("Scanning {}", request.root.display());
        let _ = progress.send(ProgressEvent::phase("scanning", 0, 0));

        let options = WalkOptions::from(&self.shared.config.scan);
        let root = request.root.clone();
        let tx = progress.clone();
        let scan_cancel = cancel.clone();
        let scan = tokio::task::spawn_blocking(move || {
            scan_directory_with_callback(&root, &options, &scan_cancel, |file| {
                let _ = tx.send(ProgressEvent::Bytes(file.size));
                let _ = tx.send(ProgressEvent::FileDone);
            })
        })
        .await
        .map_err(|e| EngineError::Io(io::Error::other(e.to_string())))??;

        info!(
            "Scanned {}: {} files, {} directories, {} bytes, {} issue(s)",
            request.root.display(),
            scan.files.len(),
            scan.directories.len(),
            scan.total_size(),
            scan.issues.len()
        );
        for issue in &scan.issues {
            warn!("{}: {}", issue.path, issue.message);
        }

        self.shared
            .repository
            .record_scan(&request.episode_id, scan.files.len(), scan.total_size())
            .await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { processed_files: 0 });
        }
        self.advance(TaskEvent::ScanFinished).await?;

        let (prior, prior_discarded) = self.load_prior(request).await?;
        let differ = Differ::from_config(&self.shared.config);
        let outcome = differ
            .diff(&scan, prior.as_ref(), cancel, Some(progress))
            .await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { processed_files: 0 });
        }

        Ok(Prepared {
            scan,
            prior,
            outcome,
            prior_discarded,
        })
    }

    async fn prepare_pipeline(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
        progress: &ProgressSender,
    ) -> Result<BackupPreparationResult> {
        self.register_episode(request).await;
        let prepared = self.scan_and_diff(request, cancel, progress).await?;

        let episode = self
            .shared
            .repository
            .update_status(&request.episode_id, EpisodeStatus::Prepared)
            .await?;
        self.advance(TaskEvent::DiffFinished { preview: true }).await?;

        let outcome = prepared.outcome;
        let file_tree = build_tree(outcome.all_files(), outcome.directories.values());

        Ok(BackupPreparationResult {
            episodes: vec![episode],
            file_tree,
            change_info: outcome.change_info,
            warnings: outcome.issues,
        })
    }

    async fn run_pipeline(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
        progress: &ProgressSender,
    ) -> Result<BackupResult> {
        let source = &request.source;
        validate_id(&source.series_id)?;
        validate_id(&source.episode_id)?;

        self.register_episode(source).await;
        let prepared = self.scan_and_diff(source, cancel, progress).await?;

        let repository = &self.shared.repository;
        repository
            .update_status(&source.episode_id, EpisodeStatus::Prepared)
            .await?;
        repository
            .update_status(&source.episode_id, EpisodeStatus::BackingUp)
            .await?;
        self.advance(TaskEvent::DiffFinished { preview: false }).await?;

        let package_root = request.destination.join(&source.episode_id);
        let dedup_plan = dedup::plan(
            prepared.prior.as_ref(),
            &prepared.outcome,
            &package_root,
            self.shared.config.packaging.deduplicate,
        )
        .await;

        let rematerialized = dedup_plan
            .rematerialize
            .iter()
            .filter_map(|path| prepared.outcome.files.get(path));
        let mut jobs: Vec<PackageJob> = prepared
            .outcome
            .files_to_package()
            .chain(rematerialized)
            .map(|file| PackageJob {
                file: file.clone(),
                source: prepared.scan.absolute(&file.path),
                target: absolute_path(&package_root, &file.path),
            })
            .collect();
        // Smallest first for optimal concurrency
        jobs.sort_by_key(|job| job.file.size);

        let total_bytes: u64 = jobs.iter().map(|job| job.file.size).sum();
        info!(
            "Packaging {} file(s), {} bytes into {}",
            jobs.len(),
            total_bytes,
            package_root.display()
        );
        let _ = progress.send(ProgressEvent::phase("packaging", jobs.len(), total_bytes));

        let DedupPlan { index, carried, .. } = dedup_plan;
        let options = PackagingOptions {
            io_budget: self.shared.config.packaging.io_budget,
            dedup_index: (!index.is_empty()).then(|| Arc::new(index)),
        };

        let report = package_files(jobs, &options, cancel, progress).await;
        let processed_files = report.processed_files();

        let PackagingReport {
            packaged,
            write_error,
        } = report;
        if let Some(error) = write_error {
            return Err(EngineError::TaskFailed {
                processed_files,
                source: Box::new(error),
            });
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { processed_files });
        }

        let failed = |source: EngineError| EngineError::TaskFailed {
            processed_files,
            source: Box::new(source),
        };

        let (manifest, stats, warnings) =
            assemble_manifest(request, &prepared, packaged, carried).map_err(failed)?;

        let store = Arc::clone(&self.shared.store);
        let to_save = manifest.clone();
        tokio::task::spawn_blocking(move || store.save(&to_save))
            .await
            .map_err(|e| failed(EngineError::Io(io::Error::other(e.to_string()))))?
            .map_err(failed)?;

        if self.shared.config.packaging.deliver_manifest_copy {
            self.deliver_manifest_copy(request, &manifest).await;
        }

        let episode_id = &source.episode_id;
        repository
            .set_package_path(episode_id, &package_root.to_string_lossy())
            .await?;
        repository.attach_manifest(episode_id, &manifest).await?;
        let episode = repository
            .update_status(episode_id, EpisodeStatus::BackedUp)
            .await?;
        self.advance(TaskEvent::PackagingFinished).await?;

        info!(
            "Backup completed: {} copied ({} bytes), {} deduplicated, {} skipped, {} unchanged, {} deleted",
            stats.copied_files,
            stats.copied_bytes,
            stats.deduplicated_files,
            stats.skipped_files,
            stats.unchanged_files,
            stats.deleted_files
        );

        Ok(BackupResult {
            episodes: vec![episode],
            manifest,
            stats,
            warnings,
        })
    }

    async fn deliver_manifest_copy(&self, request: &RunRequest, manifest: &Manifest) {
        let path = request
            .destination
            .join(format!("{}-{}-manifest.json", manifest.series_id, manifest.episode_id));

        let written = match serde_json::to_vec_pretty(manifest) {
            Ok(json) => tokio::task::spawn_blocking({
                let path = path.clone();
                move || write_atomically(&path, &json)
            })
            .await
            .map_err(|e| EngineError::Io(io::Error::other(e.to_string())))
            .and_then(|r| r),
            Err(e) => Err(e.into()),
        };

        match written {
            Ok(()) => debug!("Delivered manifest copy to {}", path.display()),
            Err(e) => warn!("Failed to deliver manifest copy: {}", e),
        }
    }
}

/// Build the manifest describing the destination after a complete run.
///
/// `carried` holds the links of unchanged files whose holder survives.
fn assemble_manifest(
    request: &RunRequest,
    prepared: &Prepared,
    packaged: Vec<Packaged>,
    carried: BTreeMap<String, String>,
) -> Result<(Manifest, PackagingStats, Vec<ScanIssue>)> {
    let source = &request.source;
    let outcome = &prepared.outcome;
    let mut manifest = Manifest::new(&source.series_id, &source.episode_id);
    let mut stats = PackagingStats {
        deleted_files: outcome.deleted.len(),
        ..PackagingStats::default()
    };
    let mut warnings = outcome.issues.clone();
    let mut deduplicated: serde_json::Map<String, serde_json::Value> = carried
        .into_iter()
        .map(|(path, holder)| (path, holder.into()))
        .collect();

    let mut packaged: HashMap<String, Packaged> = packaged
        .into_iter()
        .map(|p| (p.path().to_string(), p))
        .collect();

    for (path, file) in &outcome.files {
        let result = packaged.remove(path);
        if file.status == FileStatus::Unchanged && result.is_none() {
            stats.unchanged_files += 1;
            manifest.files.insert(path.clone(), file.clone());
            continue;
        }

        match result {
            Some(Packaged::Copied(copied)) => {
                stats.copied_files += 1;
                stats.copied_bytes += copied.size;
                manifest.files.insert(path.clone(), copied);
            }
            Some(Packaged::Deduplicated { file, existing }) => {
                stats.deduplicated_files += 1;
                deduplicated.insert(path.clone(), existing.into());
                manifest.files.insert(path.clone(), file);
            }
            Some(Packaged::SourceFailed { error, .. }) => {
                stats.skipped_files += 1;
                warnings.push(ScanIssue::from_io(path.clone(), &error));
                // Keep describing what the destination still holds
                if let Some(previous) = prepared.prior.as_ref().and_then(|m| m.files.get(path)) {
                    let mut kept = previous.clone();
                    kept.error = Some(error.to_string());
                    manifest.files.insert(path.clone(), kept);
                }
            }
            None => {
                stats.skipped_files += 1;
                warn!("{} was not packaged", path);
            }
        }
    }

    manifest.directories = outcome.directories.clone();

    let metadata = &mut manifest.metadata;
    metadata.insert(
        "sourceRoot".into(),
        prepared.scan.root.to_string_lossy().into_owned().into(),
    );
    metadata.insert(
        "destination".into(),
        request.destination.to_string_lossy().into_owned().into(),
    );
    metadata.insert("changeInfo".into(), serde_json::to_value(outcome.change_info)?);
    if !deduplicated.is_empty() {
        metadata.insert(DEDUPLICATED_KEY.into(), deduplicated.into());
    }
    if let Some(reason) = &prepared.prior_discarded {
        metadata.insert("priorManifestDiscarded".into(), reason.clone().into());
    }
    manifest.rebuild_hash_index();

    Ok((manifest, stats, warnings))
}
