//! Manifest persistence.
//!
//! The engine only needs "load the last manifest of an episode" and "save
//! the new one". `JsonManifestStore` keeps one pretty-printed JSON file per
//! episode under `<dir>/<series>/<episode>.manifest.json`; `MemoryManifestStore`
//! backs tests and embedders that persist elsewhere.

use crate::manifest::Manifest;
use crate::utils::errors::{EngineError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

/// Load/save contract for the durable "last known state" of an episode.
pub trait ManifestStore: Send + Sync {
    /// `Ok(None)` when the episode has never been backed up.
    /// `Err(EngineError::Diff)` when a manifest exists but is unusable.
    fn load(&self, series_id: &str, episode_id: &str) -> Result<Option<Manifest>>;

    /// Persist a manifest; either the whole manifest is stored or nothing is.
    fn save(&self, manifest: &Manifest) -> Result<()>;
}

/// One JSON file per episode on the local filesystem
#[derive(Debug, Clone)]
pub struct JsonManifestStore {
    dir: PathBuf,
}

impl JsonManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the manifest for an episode
    pub fn manifest_path(&self, series_id: &str, episode_id: &str) -> Result<PathBuf> {
        validate_id(series_id)?;
        validate_id(episode_id)?;
        Ok(self
            .dir
            .join(series_id)
            .join(format!("{episode_id}.manifest.json")))
    }
}

impl ManifestStore for JsonManifestStore {
    fn load(&self, series_id: &str, episode_id: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(series_id, episode_id)?;

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest at {}, first backup", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let unusable = |reason: String| EngineError::Diff {
            series_id: series_id.to_string(),
            episode_id: episode_id.to_string(),
            reason,
        };

        let mut manifest: Manifest =
            serde_json::from_str(&content).map_err(|e| unusable(format!("corrupt JSON: {e}")))?;

        if !manifest.is_compatible_version() {
            return Err(unusable(format!(
                "unsupported schema version {}",
                manifest.version
            )));
        }
        if manifest.series_id != series_id || manifest.episode_id != episode_id {
            return Err(unusable(format!(
                "manifest belongs to {}/{}",
                manifest.series_id, manifest.episode_id
            )));
        }
        if let Some((key, file)) = manifest.files.iter().find(|(key, file)| **key != file.path) {
            return Err(unusable(format!(
                "file entry {key} records path {}",
                file.path
            )));
        }

        // The persisted index is a cache; rebuild it from the files map.
        manifest.rebuild_hash_index();

        info!(
            "Loaded manifest {}/{}: {} files, {} bytes",
            series_id,
            episode_id,
            manifest.files.len(),
            manifest.total_size()
        );
        Ok(Some(manifest))
    }

    fn save(&self, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(&manifest.series_id, &manifest.episode_id)?;
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomically(&path, &json)?;

        info!(
            "Saved manifest {}/{} to {}",
            manifest.series_id,
            manifest.episode_id,
            path.display()
        );
        Ok(())
    }
}

/// Write `data` to `path` via a temporary sibling and a rename, so readers
/// never observe a partially written file.
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let write_err = |source: std::io::Error| EngineError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data).map_err(write_err)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(write_err(e));
    }
    Ok(())
}

/// Reject ids that would escape their directory when used as a path component
pub(crate) fn validate_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control);
    if bad {
        return Err(EngineError::Config(format!(
            "invalid series/episode identifier: {id:?}"
        )));
    }
    Ok(())
}

/// In-process store keyed by (series, episode)
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    manifests: RwLock<HashMap<(String, String), Manifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.manifests.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ManifestStore for MemoryManifestStore {
    fn load(&self, series_id: &str, episode_id: &str) -> Result<Option<Manifest>> {
        let manifests = self
            .manifests
            .read()
            .map_err(|_| EngineError::Config("manifest store lock poisoned".into()))?;
        let key = (series_id.to_string(), episode_id.to_string());
        Ok(manifests.get(&key).cloned().map(|mut manifest| {
            manifest.rebuild_hash_index();
            manifest
        }))
    }

    fn save(&self, manifest: &Manifest) -> Result<()> {
        let mut manifests = self
            .manifests
            .write()
            .map_err(|_| EngineError::Config("manifest store lock poisoned".into()))?;
        manifests.insert(
            (manifest.series_id.clone(), manifest.episode_id.clone()),
            manifest.clone(),
        );
        Ok(())
    }
}
