//! End-to-end backup scenarios against real directories.

use beanckup_engine::config::DiffMode;
use beanckup_engine::tree::find;
use beanckup_engine::{
    ChangeInfo, EngineConfig, EngineError, EpisodeStatus, FileStatus, JsonManifestStore, ManifestStore,
    MemoryManifestStore, PrepareRequest, TaskDriver, TaskPhase,
};
use filetime::FileTime;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const SERIES: &str = "series-1";
const EPISODE: &str = "ep-1";

fn write(root: &Path, rel: &str, body: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

/// `a.txt` (10 bytes) and `dir/b.txt` (20 bytes)
fn sample_episode() -> TempDir {
    let root = TempDir::new().unwrap();
    write(root.path(), "a.txt", &[b'a'; 10]);
    write(root.path(), "dir/b.txt", &[b'b'; 20]);
    root
}

fn driver(store: &Arc<MemoryManifestStore>) -> TaskDriver {
    TaskDriver::new(EngineConfig::default(), store.clone())
}

fn request(root: &Path) -> PrepareRequest {
    PrepareRequest::new(root, SERIES, EPISODE)
}

fn no_changes(total_size: u64) -> ChangeInfo {
    ChangeInfo {
        new_count: 0,
        modified_count: 0,
        deleted_count: 0,
        total_size,
    }
}

#[tokio::test]
async fn concrete_two_run_scenario() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    let first = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(
        first.change_info,
        ChangeInfo {
            new_count: 2,
            modified_count: 0,
            deleted_count: 0,
            total_size: 30
        }
    );

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;

    write(root.path(), "a.txt", &[b'A'; 15]);
    std::fs::remove_file(root.path().join("dir/b.txt"))?;
    write(root.path(), "c.txt", &[b'c'; 5]);

    let second = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(
        second.change_info,
        ChangeInfo {
            new_count: 1,
            modified_count: 1,
            deleted_count: 1,
            total_size: 20
        }
    );
    Ok(())
}

#[tokio::test]
async fn unchanged_tree_diffs_clean_and_is_idempotent() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;

    for _ in 0..2 {
        let prepared = driver.prepare_backup(request(root.path())).await?;
        assert_eq!(prepared.change_info, no_changes(30));
        assert!(prepared.warnings.is_empty());
    }

    let again = driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    assert_eq!(again.stats.copied_files, 0);
    assert_eq!(again.stats.unchanged_files, 2);
    assert_eq!(driver.prepare_backup(request(root.path())).await?.change_info, no_changes(30));
    Ok(())
}

#[tokio::test]
async fn deleted_file_stays_visible_in_tree() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    let before = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(
        find(&before.file_tree, "dir/b.txt").and_then(|n| n.status),
        Some(FileStatus::New)
    );

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    std::fs::remove_dir_all(root.path().join("dir"))?;

    let after = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(after.change_info.deleted_count, 1);
    let node = find(&after.file_tree, "dir/b.txt").expect("deleted file in tree");
    assert_eq!(node.status, Some(FileStatus::Deleted));
    assert!(find(&after.file_tree, "dir").is_some_and(|n| n.is_dir && n.status.is_none()));
    Ok(())
}

#[tokio::test]
async fn rename_is_delete_plus_new() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    std::fs::rename(root.path().join("a.txt"), root.path().join("renamed.txt"))?;

    let prepared = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(
        prepared.change_info,
        ChangeInfo {
            new_count: 1,
            modified_count: 0,
            deleted_count: 1,
            total_size: 30
        }
    );
    assert_eq!(
        find(&prepared.file_tree, "a.txt").and_then(|n| n.status),
        Some(FileStatus::Deleted)
    );
    assert_eq!(
        find(&prepared.file_tree, "renamed.txt").and_then(|n| n.status),
        Some(FileStatus::New)
    );
    Ok(())
}

#[tokio::test]
async fn tree_order_is_deterministic_across_mtimes() -> TestResult {
    let layout = ["zoo/1.txt", "Zoo/2.txt", "b.txt", "a/deep/x.txt", "B.txt", "empty/"];
    let build = |mtime: i64| {
        let root = TempDir::new().unwrap();
        for rel in layout {
            if let Some(dir) = rel.strip_suffix('/') {
                std::fs::create_dir_all(root.path().join(dir)).unwrap();
            } else {
                write(root.path(), rel, b"same");
                filetime::set_file_mtime(root.path().join(rel), FileTime::from_unix_time(mtime, 0))
                    .unwrap();
            }
        }
        root
    };
    let first = build(1_000_000);
    let second = build(2_000_000);
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    let a = driver
        .prepare_backup(PrepareRequest::new(first.path(), SERIES, "ep-a"))
        .await?;
    let b = driver
        .prepare_backup(PrepareRequest::new(second.path(), SERIES, "ep-b"))
        .await?;

    assert_eq!(a.file_tree, b.file_tree);
    let top: Vec<&str> = a.file_tree.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(top, vec!["Zoo", "a", "empty", "zoo", "B.txt", "b.txt"]);
    Ok(())
}

#[tokio::test]
async fn touched_but_unchanged_file_is_unchanged() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    filetime::set_file_mtime(root.path().join("a.txt"), FileTime::from_unix_time(1_234_567, 0))?;

    let prepared = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(prepared.change_info, no_changes(30));
    Ok(())
}

#[tokio::test]
async fn verify_mode_catches_change_hidden_from_metadata() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let pinned = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(root.path().join("a.txt"), pinned)?;

    let store = Arc::new(MemoryManifestStore::new());
    driver(&store)
        .run_backup(request(root.path()).into_run(dest.path()))
        .await?;

    // Same length, same mtime, different bytes
    write(root.path(), "a.txt", &[b'z'; 10]);
    filetime::set_file_mtime(root.path().join("a.txt"), pinned)?;

    let fast = driver(&store).prepare_backup(request(root.path())).await?;
    assert_eq!(fast.change_info, no_changes(30));

    let mut config = EngineConfig::default();
    config.diff.mode = DiffMode::Verify;
    let verify = TaskDriver::new(config, store.clone());
    let prepared = verify.prepare_backup(request(root.path())).await?;
    assert_eq!(prepared.change_info.modified_count, 1);
    assert_eq!(
        find(&prepared.file_tree, "a.txt").and_then(|n| n.status),
        Some(FileStatus::Modified)
    );
    Ok(())
}

#[tokio::test]
async fn manifest_round_trips_through_json_store() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let manifests = TempDir::new()?;
    let store = Arc::new(JsonManifestStore::new(manifests.path()));
    let driver = TaskDriver::new(EngineConfig::default(), store.clone());

    let result = driver.run_backup(request(root.path()).into_run(dest.path())).await?;

    let loaded = store.load(SERIES, EPISODE)?.expect("manifest saved");
    assert_eq!(loaded, result.manifest);
    assert!(loaded.hash_index_is_consistent());
    assert!(loaded.hash_to_file.values().all(|p| loaded.files.contains_key(p)));
    assert_eq!(loaded.files.len(), 2);
    assert_eq!(loaded.directories["dir"].total_size, 20);

    let delivered: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dest.path().join("series-1-ep-1-manifest.json"))?)?;
    assert_eq!(delivered["episodeId"], EPISODE);
    Ok(())
}

#[tokio::test]
async fn duplicate_content_is_not_copied_twice() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    std::fs::copy(root.path().join("a.txt"), root.path().join("a-copy.txt"))?;

    let result = driver.run_backup(request(root.path()).into_run(dest.path())).await?;

    assert_eq!(result.stats.deduplicated_files, 1);
    assert_eq!(result.stats.copied_files, 0);
    assert!(!dest.path().join(EPISODE).join("a-copy.txt").exists());
    assert!(result.manifest.files.contains_key("a-copy.txt"));
    assert_eq!(result.manifest.metadata["deduplicated"]["a-copy.txt"], "a.txt");
    Ok(())
}

#[tokio::test]
async fn cancelling_mid_run_keeps_copied_files_and_commits_nothing() -> TestResult {
    let root = TempDir::new()?;
    for i in 0..300 {
        write(root.path(), &format!("take-{i:03}.wav"), &vec![(i % 251) as u8; 4096]);
    }
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let mut config = EngineConfig::default();
    config.packaging.io_budget = 1;
    config.progress.publish_interval_ms = 0;
    let driver = TaskDriver::new(config, store.clone());

    let mut rx = driver.subscribe();
    let task = driver.start_backup(request(root.path()).into_run(dest.path())).await?;

    let mut processed_when_cancelled = 0;
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        if status.current_phase == "packaging" && status.processed_files >= 1 {
            processed_when_cancelled = status.processed_files;
            assert!(driver.cancel_task().await);
            break;
        }
        if !status.is_running {
            break;
        }
    }

    let err = task.wait().await.expect_err("run was cancelled");
    let processed_files = match err {
        EngineError::Cancelled { processed_files } => processed_files,
        other => panic!("expected cancellation, got {other}"),
    };
    assert!(processed_files >= processed_when_cancelled);
    assert!(processed_files < 300);

    let status = driver.task_status();
    assert!(!status.is_running);
    assert_eq!(status.current_phase, "cancelled");
    assert_eq!(driver.state().await, TaskPhase::Idle);
    assert!(store.is_empty());
    assert!(!dest.path().join("series-1-ep-1-manifest.json").exists());

    let names: Vec<String> = std::fs::read_dir(dest.path().join(EPISODE))?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    assert!(names.len() >= processed_when_cancelled);
    assert!(names.iter().all(|name| !name.ends_with(".partial")));

    let episode = driver.repository().get(EPISODE).await.expect("episode registered");
    assert_eq!(episode.status, EpisodeStatus::Prepared);
    Ok(())
}

#[tokio::test]
async fn episode_lifecycle_follows_runs() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    let prepared = driver.prepare_backup(request(root.path())).await?;
    assert_eq!(prepared.episodes[0].status, EpisodeStatus::Prepared);

    let result = driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    let episode = &result.episodes[0];
    assert_eq!(episode.status, EpisodeStatus::BackedUp);
    assert_eq!(episode.file_count, 2);
    assert_eq!(episode.total_size, 30);
    assert!(episode.package_path.is_some());

    let record = driver.repository().manifest_record(EPISODE).await.expect("manifest attached");
    assert_eq!(record.file_count, 2);
    Ok(())
}

#[tokio::test]
async fn duplicate_of_a_rewritten_file_gets_its_own_copy() -> TestResult {
    let root = TempDir::new()?;
    write(root.path(), "a.txt", b"XXXX");
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    write(root.path(), "a.txt", b"YYYYYYY");
    write(root.path(), "b.txt", b"XXXX");

    let result = driver.run_backup(request(root.path()).into_run(dest.path())).await?;

    assert_eq!(result.stats.copied_files, 2);
    assert_eq!(result.stats.deduplicated_files, 0);
    assert!(!result.manifest.metadata.contains_key("deduplicated"));
    let stored = dest.path().join(EPISODE);
    assert_eq!(std::fs::read(stored.join("a.txt"))?, b"YYYYYYY");
    assert_eq!(std::fs::read(stored.join("b.txt"))?, b"XXXX");
    Ok(())
}

#[tokio::test]
async fn deduplicated_link_survives_until_its_holder_changes() -> TestResult {
    let root = TempDir::new()?;
    write(root.path(), "a.txt", b"XXXX");
    let dest = TempDir::new()?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);
    let stored = dest.path().join(EPISODE);

    driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    write(root.path(), "b.txt", b"XXXX");
    let linked = driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    assert_eq!(linked.stats.deduplicated_files, 1);
    assert!(!stored.join("b.txt").exists());

    let idle = driver.run_backup(request(root.path()).into_run(dest.path())).await?;
    assert_eq!(idle.stats.unchanged_files, 2);
    assert_eq!(idle.manifest.metadata["deduplicated"]["b.txt"], "a.txt");
    assert_eq!(idle.manifest.path_for_hash(&idle.manifest.files["a.txt"].content_hash), Some("a.txt"));

    write(root.path(), "a.txt", b"YYYYYYY");
    let rewritten = driver.run_backup(request(root.path()).into_run(dest.path())).await?;

    assert_eq!(rewritten.stats.copied_files, 2);
    assert_eq!(rewritten.stats.unchanged_files, 0);
    assert!(!rewritten.manifest.metadata.contains_key("deduplicated"));
    assert_eq!(rewritten.manifest.files["b.txt"].status, FileStatus::Unchanged);
    assert_eq!(std::fs::read(stored.join("a.txt"))?, b"YYYYYYY");
    assert_eq!(std::fs::read(stored.join("b.txt"))?, b"XXXX");
    Ok(())
}

#[tokio::test]
async fn unwritable_destination_fails_the_run() -> TestResult {
    let root = sample_episode();
    let dest = TempDir::new()?;
    // A regular file where the episode directory belongs
    std::fs::write(dest.path().join(EPISODE), b"")?;
    let store = Arc::new(MemoryManifestStore::new());
    let driver = driver(&store);

    let err = driver
        .run_backup(request(root.path()).into_run(dest.path()))
        .await
        .expect_err("destination cannot hold files");
    match err {
        EngineError::TaskFailed { processed_files, source } => {
            assert_eq!(processed_files, 0);
            assert!(matches!(*source, EngineError::Write { .. }), "unexpected source: {source}");
        }
        other => panic!("expected a failed task, got {other}"),
    }

    let status = driver.task_status();
    assert!(!status.is_running);
    assert_eq!(status.current_phase, "failed");
    assert_eq!(driver.state().await, TaskPhase::Idle);
    assert!(store.is_empty());
    assert!(!dest.path().join("series-1-ep-1-manifest.json").exists());

    let episode = driver.repository().get(EPISODE).await.expect("episode registered");
    assert_eq!(episode.status, EpisodeStatus::Failed);
    Ok(())
}
