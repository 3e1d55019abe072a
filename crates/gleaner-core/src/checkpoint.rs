//! Durable, resumable record of which harvest jobs are done.
//!
//! The checkpoint is a single JSON document keyed by store (the scope) with
//! `completed` and `failed` sets of categories (the items). Store workers
//! write only their own scope; [`CheckpointStore::flush`] persists the whole
//! tree. Flushes are serialized and each one snapshots the tree *inside*
//! the flush lock, so a slow earlier flush can never overwrite a later one.
//!
//! A crash between `record_outcome` and the next `flush` loses at most the
//! outcomes recorded in that window; those jobs simply run again.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Outcomes recorded for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
}

/// The persisted checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    #[serde(default)]
    pub stores: BTreeMap<String, ScopeRecord>,
    #[serde(default)]
    pub api_calls_used: u64,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
}

impl CheckpointData {
    pub fn completed_count(&self) -> usize {
        self.stores.values().map(|s| s.completed.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.stores.values().map(|s| s.failed.len()).sum()
    }
}

/// In-memory checkpoint tree backed by a JSON file.
pub struct CheckpointStore {
    path: PathBuf,
    data: Mutex<CheckpointData>,
    flush_lock: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
}

impl CheckpointStore {
    /// Start with an empty checkpoint that will be written to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self::with_data(path, CheckpointData::default())
    }

    fn with_data(path: impl Into<PathBuf>, data: CheckpointData) -> Self {
        Self {
            path: path.into(),
            data: Mutex::new(data),
            flush_lock: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Read the checkpoint at `path`.
    ///
    /// A missing or unreadable file yields an empty checkpoint: corruption
    /// only forfeits resumability for this run, it never aborts it.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CheckpointData>(&bytes) {
                Ok(data) => {
                    tracing::info!(
                        path = %path.display(),
                        completed = data.completed_count(),
                        failed = data.failed_count(),
                        "Loaded checkpoint"
                    );
                    data
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Checkpoint is corrupt, starting from scratch"
                    );
                    CheckpointData::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No checkpoint found, starting fresh");
                CheckpointData::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read checkpoint, starting from scratch"
                );
                CheckpointData::default()
            }
        };
        Self::with_data(path, data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the data lock, recovering from poison if necessary.
    fn lock_data(&self) -> MutexGuard<'_, CheckpointData> {
        self.data.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned checkpoint mutex");
            poisoned.into_inner()
        })
    }

    /// True iff `item` is in the completed set of `scope`.
    pub fn is_done(&self, scope: &str, item: &str) -> bool {
        self.lock_data()
            .stores
            .get(scope)
            .is_some_and(|s| s.completed.contains(item))
    }

    pub fn is_failed(&self, scope: &str, item: &str) -> bool {
        self.lock_data()
            .stores
            .get(scope)
            .is_some_and(|s| s.failed.contains(item))
    }

    /// Record a job outcome. Returns whether the checkpoint changed.
    ///
    /// Success moves an item out of `failed`. A failure never demotes an
    /// item that is already completed.
    pub fn record_outcome(&self, scope: &str, item: &str, success: bool) -> bool {
        let mut data = self.lock_data();
        let record = data.stores.entry(scope.to_string()).or_default();
        let changed = if success {
            let removed = record.failed.remove(item);
            record.completed.insert(item.to_string()) || removed
        } else if record.completed.contains(item) {
            false
        } else {
            record.failed.insert(item.to_string())
        };
        if changed {
            self.dirty.store(true, Ordering::Release);
        }
        changed
    }

    pub fn record_api_calls(&self, calls: u64) {
        if calls == 0 {
            return;
        }
        self.lock_data().api_calls_used += calls;
        self.dirty.store(true, Ordering::Release);
    }

    pub fn api_calls_used(&self) -> u64 {
        self.lock_data().api_calls_used
    }

    /// Forget every outcome recorded for `scope`. Returns whether it existed.
    pub fn reset_scope(&self, scope: &str) -> bool {
        let removed = self.lock_data().stores.remove(scope).is_some();
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    pub fn scope(&self, scope: &str) -> Option<ScopeRecord> {
        self.lock_data().stores.get(scope).cloned()
    }

    pub fn snapshot(&self) -> CheckpointData {
        self.lock_data().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Persist the full in-memory tree.
    ///
    /// Writes to a sibling temp file and renames it over the checkpoint, so a
    /// crash mid-write leaves the previous checkpoint intact.
    pub async fn flush(&self) -> Result<(), AppError> {
        let _guard = self.flush_lock.lock().await;

        let saved_at = Utc::now();
        let snapshot = {
            let data = self.lock_data();
            self.dirty.store(false, Ordering::Release);
            let mut snapshot = data.clone();
            snapshot.last_saved = Some(saved_at);
            snapshot
        };

        if let Err(e) = self.write_atomically(&snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        self.lock_data().last_saved = Some(saved_at);
        tracing::debug!(
            path = %self.path.display(),
            completed = snapshot.completed_count(),
            failed = snapshot.failed_count(),
            "Checkpoint flushed"
        );
        Ok(())
    }

    /// Flush only if something changed since the last flush.
    pub async fn flush_if_dirty(&self) -> Result<bool, AppError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    async fn write_atomically(&self, snapshot: &CheckpointData) -> Result<(), AppError> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::CheckpointError(format!(
                    "Failed to create checkpoint directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &json).await.map_err(|e| {
            AppError::CheckpointError(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            AppError::CheckpointError(format!(
                "Failed to move checkpoint into place at {}: {e}",
                self.path.display()
            ))
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Flush periodically until `cancel` fires, then flush one last time.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                if let Err(e) = store.flush_if_dirty().await {
                    tracing::warn!(error = %e, "Periodic checkpoint flush failed");
                }
            }
            if let Err(e) = store.flush_if_dirty().await {
                tracing::warn!(error = %e, "Final checkpoint flush failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("state").join("checkpoint.json")
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::load(checkpoint_path(&dir)).await;
        assert_eq!(store.snapshot(), CheckpointData::default());
        assert!(!store.is_done("acme", "tops"));
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = CheckpointStore::load(&path).await;
        assert_eq!(store.snapshot().completed_count(), 0);
    }

    #[tokio::test]
    async fn flushed_outcomes_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        let store = CheckpointStore::load(&path).await;
        store.record_outcome("acme", "dresses", true);
        store.record_outcome("acme", "shoes", false);
        store.record_outcome("globex", "tops", true);
        store.record_api_calls(7);
        store.flush().await.unwrap();

        let reloaded = CheckpointStore::load(&path).await;
        assert!(reloaded.is_done("acme", "dresses"));
        assert!(!reloaded.is_done("acme", "shoes"));
        assert!(reloaded.is_failed("acme", "shoes"));
        assert!(reloaded.is_done("globex", "tops"));
        assert_eq!(reloaded.api_calls_used(), 7);
        assert!(reloaded.snapshot().last_saved.is_some());
    }

    #[tokio::test]
    async fn record_outcome_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::empty(checkpoint_path(&dir));
        assert!(store.record_outcome("acme", "tops", true));
        assert!(!store.record_outcome("acme", "tops", true));
        assert_eq!(store.scope("acme").unwrap().completed.len(), 1);
    }

    #[tokio::test]
    async fn item_is_never_both_completed_and_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::empty(checkpoint_path(&dir));

        store.record_outcome("acme", "tops", false);
        assert!(store.is_failed("acme", "tops"));

        store.record_outcome("acme", "tops", true);
        let scope = store.scope("acme").unwrap();
        assert!(scope.completed.contains("tops"));
        assert!(!scope.failed.contains("tops"));

        assert!(!store.record_outcome("acme", "tops", false));
        assert!(store.is_done("acme", "tops"));
        assert!(!store.is_failed("acme", "tops"));
    }

    #[tokio::test]
    async fn concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        let store = Arc::new(CheckpointStore::empty(&path));

        let mut tasks = Vec::new();
        for s in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let scope = format!("store-{s}");
                for i in 0..20 {
                    store.record_outcome(&scope, &format!("cat-{i}"), i % 3 != 0);
                    store.flush().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let reloaded = CheckpointStore::load(&path).await;
        let data = reloaded.snapshot();
        assert_eq!(data.stores.len(), 8);
        assert_eq!(data.completed_count() + data.failed_count(), 160);
    }

    #[tokio::test]
    async fn flush_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        let store = CheckpointStore::empty(&path);
        store.record_outcome("acme", "tops", true);
        store.flush().await.unwrap();

        assert!(path.exists());
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn flush_if_dirty_skips_clean_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        let store = CheckpointStore::empty(&path);

        assert!(!store.flush_if_dirty().await.unwrap());
        assert!(!path.exists());

        store.record_outcome("acme", "tops", true);
        assert!(store.flush_if_dirty().await.unwrap());
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn reset_scope_forgets_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::empty(checkpoint_path(&dir));
        store.record_outcome("acme", "tops", true);
        store.record_outcome("globex", "tops", true);

        assert!(store.reset_scope("acme"));
        assert!(!store.reset_scope("acme"));
        assert!(!store.is_done("acme", "tops"));
        assert!(store.is_done("globex", "tops"));
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_writes_final_state_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        let store = Arc::new(CheckpointStore::empty(&path));
        let cancel = CancellationToken::new();
        let flusher = store.spawn_flusher(Duration::from_secs(3600), cancel.clone());

        store.record_outcome("acme", "tops", true);
        cancel.cancel();
        flusher.await.unwrap();

        let reloaded = CheckpointStore::load(&path).await;
        assert!(reloaded.is_done("acme", "tops"));
    }
}
