//! In-memory registry of episodes and their latest backup.

use crate::manifest::Manifest;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Episode lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpisodeStatus {
    Draft,
    Prepared,
    BackingUp,
    BackedUp,
    Failed,
}

impl EpisodeStatus {
    pub fn can_transition_to(self, to: EpisodeStatus) -> bool {
        use EpisodeStatus::*;
        matches!(
            (self, to),
            (Draft, Prepared)
                | (Prepared, Prepared)
                | (Prepared, BackingUp)
                | (BackingUp, BackedUp)
                | (BackingUp, Failed)
                | (BackingUp, Prepared)
                | (BackedUp, Prepared)
                | (Failed, Prepared)
        )
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EpisodeStatus::Draft => "draft",
            EpisodeStatus::Prepared => "prepared",
            EpisodeStatus::BackingUp => "backing-up",
            EpisodeStatus::BackedUp => "backed-up",
            EpisodeStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub name: String,
    pub series_id: String,
    pub created_at: DateTime<Utc>,
    pub status: EpisodeStatus,

    /// Where the last successful run wrote its files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_path: Option<String>,

    /// Counts from the latest scan
    pub file_count: usize,
    pub total_size: u64,

    /// Caller-supplied estimate from before any scan
    pub estimated_size: u64,
}

impl Episode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, series_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            series_id: series_id.into(),
            created_at: Utc::now(),
            status: EpisodeStatus::Draft,
            package_path: None,
            file_count: 0,
            total_size: 0,
            estimated_size: 0,
        }
    }
}

/// Reference to the manifest produced by a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRecord {
    pub series_id: String,
    pub episode_id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
}

impl From<&Manifest> for ManifestRecord {
    fn from(manifest: &Manifest) -> Self {
        Self {
            series_id: manifest.series_id.clone(),
            episode_id: manifest.episode_id.clone(),
            created_at: manifest.created_at,
            file_count: manifest.files.len(),
            total_size: manifest.total_size(),
        }
    }
}

#[derive(Default)]
struct Registry {
    episodes: HashMap<String, Episode>,
    manifests: HashMap<String, ManifestRecord>,
}

/// Tracks known episodes; cheap to clone and share
#[derive(Clone, Default)]
pub struct EpisodeRepository {
    inner: Arc<RwLock<Registry>>,
}

impl EpisodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new draft episode with a generated id
    pub async fn create(&self, name: &str, series_id: &str, estimated_size: u64) -> Episode {
        let mut episode = Episode::new(Uuid::new_v4().to_string(), name, series_id);
        episode.estimated_size = estimated_size;

        let mut registry = self.inner.write().await;
        registry.episodes.insert(episode.id.clone(), episode.clone());
        episode
    }

    /// Register an episode, replacing any with the same id
    pub async fn insert(&self, episode: Episode) {
        let mut registry = self.inner.write().await;
        registry.episodes.insert(episode.id.clone(), episode);
    }

    /// Return the episode, registering a draft under `id` if unknown
    pub async fn ensure(&self, id: &str, name: &str, series_id: &str) -> Episode {
        let mut registry = self.inner.write().await;
        registry
            .episodes
            .entry(id.to_string())
            .or_insert_with(|| Episode::new(id, name, series_id))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Episode> {
        self.inner.read().await.episodes.get(id).cloned()
    }

    /// All episodes, oldest first
    pub async fn list(&self) -> Vec<Episode> {
        let registry = self.inner.read().await;
        let mut episodes: Vec<Episode> = registry.episodes.values().cloned().collect();
        episodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        episodes
    }

    pub async fn list_series(&self, series_id: &str) -> Vec<Episode> {
        self.list()
            .await
            .into_iter()
            .filter(|e| e.series_id == series_id)
            .collect()
    }

    pub async fn remove(&self, id: &str) -> Option<Episode> {
        let mut registry = self.inner.write().await;
        registry.manifests.remove(id);
        registry.episodes.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.episodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Move an episode along its lifecycle
    pub async fn update_status(&self, id: &str, status: EpisodeStatus) -> Result<Episode> {
        self.modify(id, |episode| {
            if !episode.status.can_transition_to(status) {
                return Err(EngineError::InvalidEpisodeStatus {
                    from: episode.status.to_string(),
                    to: status.to_string(),
                });
            }
            episode.status = status;
            Ok(())
        })
        .await
    }

    /// Record the counts of the latest scan
    pub async fn record_scan(&self, id: &str, file_count: usize, total_size: u64) -> Result<Episode> {
        self.modify(id, |episode| {
            episode.file_count = file_count;
            episode.total_size = total_size;
            Ok(())
        })
        .await
    }

    pub async fn set_package_path(&self, id: &str, path: &str) -> Result<Episode> {
        self.modify(id, |episode| {
            episode.package_path = Some(path.to_string());
            Ok(())
        })
        .await
    }

    /// Attach the manifest of a completed run
    pub async fn attach_manifest(&self, id: &str, manifest: &Manifest) -> Result<()> {
        let mut registry = self.inner.write().await;
        if !registry.episodes.contains_key(id) {
            return Err(EngineError::EpisodeNotFound(id.to_string()));
        }
        registry.manifests.insert(id.to_string(), ManifestRecord::from(manifest));
        Ok(())
    }

    pub async fn manifest_record(&self, id: &str) -> Option<ManifestRecord> {
        self.inner.read().await.manifests.get(id).cloned()
    }

    async fn modify<F>(&self, id: &str, change: F) -> Result<Episode>
    where
        F: FnOnce(&mut Episode) -> Result<()>,
    {
        let mut registry = self.inner.write().await;
        let episode = registry
            .episodes
            .get_mut(id)
            .ok_or_else(|| EngineError::EpisodeNotFound(id.to_string()))?;
        change(episode)?;
        Ok(episode.clone())
    }
}
