//! Golden dataset snapshots — the fallback of last resort.
//!
//! A golden snapshot is a durable last-known-good copy of a whole
//! dataset (e.g. 220 days of BTC price history), mutated only by
//! successful fetches and deleted only by explicit call. Its age is
//! unbounded: golden data is always *acceptable*, never *fresh*.
//!
//! Persistence goes through the [`SnapshotBackend`] trait so the storage
//! can be swapped (tests use the backendless in-memory mode). The
//! default backend, [`FileSnapshotStore`], keeps one JSON file per
//! dataset and writes atomically (tmp file + rename) so a crash mid-write
//! never corrupts the previous snapshot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{MuninError, Result};

/// A durable last-known-good copy of one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenSnapshot {
    pub dataset_id: String,
    pub payload: Value,
    pub captured_at: DateTime<Utc>,
}

/// Storage for golden snapshots.
///
/// Implementations must persist across process restarts; the in-memory
/// mode of [`GoldenStore`] exists for tests and simply has no backend.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Load every persisted snapshot (called once at open).
    async fn load_all(&self) -> Result<Vec<GoldenSnapshot>>;

    /// Persist one snapshot, replacing any previous copy.
    async fn persist(&self, snapshot: &GoldenSnapshot) -> Result<()>;

    /// Remove a persisted snapshot. Removing a missing id is not an error.
    async fn remove(&self, dataset_id: &str) -> Result<()>;
}

/// JSON-file snapshot backend: one `<dataset_id>.json` per dataset.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a backend rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform default: `<data_dir>/munin/golden`.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("munin")
            .join("golden")
    }

    fn path_for(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{dataset_id}.json"))
    }
}

#[async_trait]
impl SnapshotBackend for FileSnapshotStore {
    async fn load_all(&self) -> Result<Vec<GoldenSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // Nothing persisted yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<GoldenSnapshot>(&bytes) {
                Ok(snapshot) => snapshots.push(snapshot),
                // A corrupt file loses one dataset, not the whole store.
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(snapshots)
    }

    async fn persist(&self, snapshot: &GoldenSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.dataset_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, dataset_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(dataset_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory view over the golden snapshots, write-through to a backend.
pub struct GoldenStore {
    snapshots: RwLock<HashMap<String, GoldenSnapshot>>,
    backend: Option<Arc<dyn SnapshotBackend>>,
}

impl GoldenStore {
    /// Non-durable store (tests, or callers that handle durability
    /// elsewhere).
    pub fn in_memory() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    /// Open a durable store, loading everything the backend has.
    pub async fn open(backend: Arc<dyn SnapshotBackend>) -> Result<Self> {
        let loaded = backend.load_all().await?;
        debug!(count = loaded.len(), "loaded golden snapshots");
        let snapshots = loaded
            .into_iter()
            .map(|s| (s.dataset_id.clone(), s))
            .collect();
        Ok(Self {
            snapshots: RwLock::new(snapshots),
            backend: Some(backend),
        })
    }

    /// Look up a snapshot, returning its payload and age.
    pub async fn get(&self, dataset_id: &str) -> Option<(Value, Duration)> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(dataset_id).map(|s| {
            let age = (Utc::now() - s.captured_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            (s.payload.clone(), age)
        })
    }

    /// Capture a snapshot, stamped now, and persist it.
    ///
    /// The in-memory copy is updated even when persistence fails, so the
    /// freshest data stays servable for this process lifetime.
    pub async fn set(&self, dataset_id: &str, payload: Value) -> Result<()> {
        validate_dataset_id(dataset_id)?;
        let snapshot = GoldenSnapshot {
            dataset_id: dataset_id.to_owned(),
            payload,
            captured_at: Utc::now(),
        };
        {
            let mut snapshots = self.snapshots.write().await;
            snapshots.insert(dataset_id.to_owned(), snapshot.clone());
        }
        if let Some(backend) = &self.backend {
            backend.persist(&snapshot).await?;
        }
        Ok(())
    }

    /// Delete a snapshot everywhere. Explicit admin action only.
    pub async fn remove(&self, dataset_id: &str) -> Result<()> {
        {
            let mut snapshots = self.snapshots.write().await;
            snapshots.remove(dataset_id);
        }
        if let Some(backend) = &self.backend {
            backend.remove(dataset_id).await?;
        }
        Ok(())
    }

    /// Number of datasets with a snapshot.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Whether no dataset has a snapshot.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Dataset ids become file names, so restrict them to a safe alphabet.
fn validate_dataset_id(dataset_id: &str) -> Result<()> {
    let ok = !dataset_id.is_empty()
        && dataset_id != "."
        && dataset_id != ".."
        && dataset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(MuninError::InvalidInput(format!(
            "invalid dataset id '{dataset_id}'"
        )))
    }
}
