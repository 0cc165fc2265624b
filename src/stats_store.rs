//! Historical per-phase aggregates, persisted atomically across runs.
//!
//! Grounded on the original `stats_manager.py`'s `load_processing_stats` /
//! `save_processing_stats` / `update_phase_stats`: a JSON map keyed by phase,
//! written via the same temp-file-then-rename atomic pattern used for every
//! other on-disk store in this crate.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tempfile::NamedTempFile;

use crate::error::KbaError;
use crate::types::{PhaseStats, ProcessingPhase};

#[derive(Default)]
struct Inner {
    stats: HashMap<ProcessingPhase, PhaseStats>,
    path: Option<PathBuf>,
}

/// Serializes read-modify-write access behind a single mutex, matching the
/// "store-level mutex" resource model.
pub struct StatsStore {
    inner: Mutex<Inner>,
}

impl StatsStore {
    /// Load from `path` if it exists, else start empty. Persistence happens
    /// lazily on `record`.
    pub fn load(path: &Path) -> Result<Self, KbaError> {
        let stats = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|e| KbaError::Storage(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| KbaError::Storage(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(StatsStore {
            inner: Mutex::new(Inner {
                stats,
                path: Some(path.to_path_buf()),
            }),
        })
    }

    /// An ephemeral store with no backing file, for tests and dry runs.
    pub fn in_memory() -> Self {
        StatsStore {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, phase: ProcessingPhase) -> PhaseStats {
        self.inner.lock().unwrap().stats.get(&phase).cloned().unwrap_or_default()
    }

    pub fn load_all(&self) -> HashMap<ProcessingPhase, PhaseStats> {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Accumulate `items_this_run`/`duration_this_run` into the phase's
    /// running totals and persist. A no-op when `items_this_run == 0`,
    /// matching the source's `items_processed_this_run <= 0` guard.
    pub async fn record(&self, phase: ProcessingPhase, items_this_run: u64, duration_this_run_seconds: f64) {
        if items_this_run == 0 {
            return;
        }

        let (snapshot, path) = {
            let mut guard = self.inner.lock().unwrap();
            let entry = guard.stats.entry(phase).or_default();
            entry.total_items_processed += items_this_run;
            entry.total_duration_seconds += duration_this_run_seconds;
            entry.avg_time_per_item_seconds = entry.total_duration_seconds / entry.total_items_processed as f64;
            entry.last_updated_timestamp = Some(Utc::now());
            (guard.stats.clone(), guard.path.clone())
        };

        if let Some(path) = path {
            if let Err(e) = persist(&path, &snapshot) {
                tracing::warn!(error = %e, "failed to persist stats store");
            }
        }
    }
}

fn persist(path: &Path, stats: &HashMap<ProcessingPhase, PhaseStats>) -> Result<(), KbaError> {
    let parent = path.parent().ok_or_else(|| KbaError::Storage("stats path has no parent directory".to_string()))?;
    fs::create_dir_all(parent).map_err(|e| KbaError::Storage(e.to_string()))?;

    let json = serde_json::to_string_pretty(stats).map_err(|e| KbaError::Storage(e.to_string()))?;

    let temp_file = NamedTempFile::new_in(parent).map_err(|e| KbaError::Storage(e.to_string()))?;
    fs::write(temp_file.path(), &json).map_err(|e| KbaError::Storage(e.to_string()))?;

    let file = fs::File::open(temp_file.path()).map_err(|e| KbaError::Storage(e.to_string()))?;
    file.sync_all().map_err(|e| KbaError::Storage(e.to_string()))?;

    temp_file.persist(path).map_err(|e| KbaError::Storage(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_is_noop_when_nothing_processed() {
        let store = StatsStore::in_memory();
        store.record(ProcessingPhase::Cache, 0, 12.0).await;
        assert_eq!(store.get(ProcessingPhase::Cache), PhaseStats::default());
    }

    #[tokio::test]
    async fn record_accumulates_across_calls() {
        let store = StatsStore::in_memory();
        store.record(ProcessingPhase::Cache, 10, 20.0).await;
        store.record(ProcessingPhase::Cache, 5, 5.0).await;

        let stats = store.get(ProcessingPhase::Cache);
        assert_eq!(stats.total_items_processed, 15);
        assert_eq!(stats.total_duration_seconds, 25.0);
        assert!((stats.avg_time_per_item_seconds - (25.0 / 15.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn persists_and_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let store = StatsStore::load(&path).unwrap();
        store.record(ProcessingPhase::Media, 3, 9.0).await;
        drop(store);

        let reloaded = StatsStore::load(&path).unwrap();
        let stats = reloaded.get(ProcessingPhase::Media);
        assert_eq!(stats.total_items_processed, 3);
        assert_eq!(stats.total_duration_seconds, 9.0);
    }
}
