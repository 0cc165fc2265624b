//! Single-writer actor owning the item collection.
//!
//! An mpsc command channel feeds a task that owns the single mutable copy of
//! the collection, replying via oneshot, with atomic JSON persistence on
//! every mutating command: a JSON map keyed by item id, mutated through the
//! typed [`ItemPatch`](crate::types::ItemPatch).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};

use crate::error::KbaError;
use crate::types::{FailureType, ItemPatch, ItemRecord, ProcessingPhase, RetryAttempt};

const CHANNEL_CAPACITY: usize = 64;
/// Bounded per `RETRY_HISTORY_CAPACITY`; see `crate::retry_manager`.
const RETRY_HISTORY_CAPACITY: usize = crate::retry_manager::RETRY_HISTORY_CAPACITY;

enum ItemStoreCommand {
    Get {
        item_id: String,
        reply: oneshot::Sender<Option<ItemRecord>>,
    },
    GetMany {
        item_ids: Vec<String>,
        reply: oneshot::Sender<Vec<ItemRecord>>,
    },
    ListAll {
        reply: oneshot::Sender<Vec<ItemRecord>>,
    },
    Upsert {
        item_id: String,
        bookmarked_item_id: String,
        source: String,
        patch: ItemPatch,
        reply: oneshot::Sender<Result<ItemRecord, KbaError>>,
    },
    SetOutcome {
        item_id: String,
        phase: ProcessingPhase,
        complete: bool,
        error: Option<String>,
        reply: oneshot::Sender<Result<(), KbaError>>,
    },
    ClearRuntimeFlags {
        item_id: String,
        reply: oneshot::Sender<Result<(), KbaError>>,
    },
    RecordRetryAttempt {
        item_id: String,
        failure_type: FailureType,
        error_message: String,
        delay_seconds: f64,
        next_retry_after: chrono::DateTime<Utc>,
        reply: oneshot::Sender<Result<(), KbaError>>,
    },
    OpenCircuitBreaker {
        item_id: String,
        until: chrono::DateTime<Utc>,
        reply: oneshot::Sender<Result<(), KbaError>>,
    },
    ListByPredicate {
        predicate: Box<dyn Fn(&ItemRecord) -> bool + Send>,
        reply: oneshot::Sender<Vec<ItemRecord>>,
    },
}

#[derive(Clone)]
pub struct ItemStoreHandle {
    sender: mpsc::Sender<ItemStoreCommand>,
}

impl ItemStoreHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ItemStoreCommand) -> Result<T, KbaError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| KbaError::Storage("item store shut down".to_string()))?;
        rx.await.map_err(|_| KbaError::Storage("item store dropped reply".to_string()))
    }

    pub async fn get(&self, item_id: &str) -> Result<Option<ItemRecord>, KbaError> {
        let item_id = item_id.to_string();
        self.call(|reply| ItemStoreCommand::Get { item_id, reply }).await
    }

    pub async fn get_many(&self, item_ids: &[String]) -> Result<Vec<ItemRecord>, KbaError> {
        let item_ids = item_ids.to_vec();
        self.call(|reply| ItemStoreCommand::GetMany { item_ids, reply }).await
    }

    pub async fn list_all(&self) -> Result<Vec<ItemRecord>, KbaError> {
        self.call(|reply| ItemStoreCommand::ListAll { reply }).await
    }

    /// Insert a new item if `item_id` is unseen, else merge `patch` onto the
    /// existing record. Returns the record's post-merge state.
    pub async fn upsert(
        &self,
        item_id: &str,
        bookmarked_item_id: &str,
        source: &str,
        patch: ItemPatch,
    ) -> Result<ItemRecord, KbaError> {
        let item_id = item_id.to_string();
        let bookmarked_item_id = bookmarked_item_id.to_string();
        let source = source.to_string();
        self.call(|reply| ItemStoreCommand::Upsert {
            item_id,
            bookmarked_item_id,
            source,
            patch,
            reply,
        })
        .await?
    }

    pub async fn set_outcome(
        &self,
        item_id: &str,
        phase: ProcessingPhase,
        complete: bool,
        error: Option<String>,
    ) -> Result<(), KbaError> {
        let item_id = item_id.to_string();
        self.call(|reply| ItemStoreCommand::SetOutcome {
            item_id,
            phase,
            complete,
            error,
            reply,
        })
        .await?
    }

    /// Reset the `force_*`/`reprocess_requested_*` runtime flags after a run
    /// has consumed them, leaving completion state untouched.
    pub async fn clear_runtime_flags(&self, item_id: &str) -> Result<(), KbaError> {
        let item_id = item_id.to_string();
        self.call(|reply| ItemStoreCommand::ClearRuntimeFlags { item_id, reply }).await?
    }

    pub async fn record_retry_attempt(
        &self,
        item_id: &str,
        failure_type: FailureType,
        error_message: &str,
        delay_seconds: f64,
        next_retry_after: chrono::DateTime<Utc>,
    ) -> Result<(), KbaError> {
        let item_id = item_id.to_string();
        let error_message = error_message.to_string();
        self.call(|reply| ItemStoreCommand::RecordRetryAttempt {
            item_id,
            failure_type,
            error_message,
            delay_seconds,
            next_retry_after,
            reply,
        })
        .await?
    }

    pub async fn open_circuit_breaker(&self, item_id: &str, until: chrono::DateTime<Utc>) -> Result<(), KbaError> {
        let item_id = item_id.to_string();
        self.call(|reply| ItemStoreCommand::OpenCircuitBreaker { item_id, until, reply }).await?
    }

    pub async fn list_by_predicate(
        &self,
        predicate: impl Fn(&ItemRecord) -> bool + Send + 'static,
    ) -> Result<Vec<ItemRecord>, KbaError> {
        self.call(|reply| ItemStoreCommand::ListByPredicate {
            predicate: Box::new(predicate),
            reply,
        })
        .await
    }
}

struct ItemStoreState {
    items: HashMap<String, ItemRecord>,
    path: Option<PathBuf>,
}

impl ItemStoreState {
    fn persist(&self) -> Result<(), KbaError> {
        let Some(path) = &self.path else { return Ok(()) };
        persist_items(path, &self.items)
    }
}

fn persist_items(path: &Path, items: &HashMap<String, ItemRecord>) -> Result<(), KbaError> {
    let parent = path
        .parent()
        .ok_or_else(|| KbaError::Storage("item store path has no parent directory".to_string()))?;
    fs::create_dir_all(parent).map_err(|e| KbaError::Storage(e.to_string()))?;

    let json = serde_json::to_string_pretty(items).map_err(|e| KbaError::Storage(e.to_string()))?;

    let temp_file = NamedTempFile::new_in(parent).map_err(|e| KbaError::Storage(e.to_string()))?;
    fs::write(temp_file.path(), &json).map_err(|e| KbaError::Storage(e.to_string()))?;

    let file = fs::File::open(temp_file.path()).map_err(|e| KbaError::Storage(e.to_string()))?;
    file.sync_all().map_err(|e| KbaError::Storage(e.to_string()))?;

    temp_file.persist(path).map_err(|e| KbaError::Storage(e.to_string()))?;
    Ok(())
}

fn load_items(path: &Path) -> Result<HashMap<String, ItemRecord>, KbaError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path).map_err(|e| KbaError::Storage(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| KbaError::Storage(e.to_string()))
}

fn handle_upsert(
    state: &mut ItemStoreState,
    item_id: &str,
    bookmarked_item_id: &str,
    source: &str,
    patch: ItemPatch,
) -> ItemRecord {
    let record = state
        .items
        .entry(item_id.to_string())
        .or_insert_with(|| ItemRecord::new(item_id, bookmarked_item_id, source));
    patch.apply(record);
    record.clone()
}

fn handle_record_retry_attempt(
    record: &mut ItemRecord,
    failure_type: FailureType,
    error_message: String,
    delay_seconds: f64,
    next_retry_after: chrono::DateTime<Utc>,
) {
    record.retry_count += 1;
    record.last_retry_attempt = Some(Utc::now());
    record.next_retry_after = Some(next_retry_after);
    record.failure_type = Some(failure_type);

    record.retry_history.push_back(RetryAttempt {
        attempt_number: record.retry_count,
        failure_type,
        error_message,
        delay_seconds,
        attempted_at: Utc::now(),
    });
    while record.retry_history.len() > RETRY_HISTORY_CAPACITY {
        record.retry_history.pop_front();
    }
    record.updated_at = Utc::now();
}

fn clear_runtime_flags(record: &mut ItemRecord) {
    record.force_reprocess_pipeline = false;
    record.force_recache = false;
    record.reprocess_requested_at = None;
    record.reprocess_requested_by = None;
    record.updated_at = Utc::now();
}

async fn run_item_store(mut rx: mpsc::Receiver<ItemStoreCommand>, mut state: ItemStoreState) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ItemStoreCommand::Get { item_id, reply } => {
                let _ = reply.send(state.items.get(&item_id).cloned());
            }
            ItemStoreCommand::GetMany { item_ids, reply } => {
                let records = item_ids.iter().filter_map(|id| state.items.get(id).cloned()).collect();
                let _ = reply.send(records);
            }
            ItemStoreCommand::ListAll { reply } => {
                let mut records: Vec<ItemRecord> = state.items.values().cloned().collect();
                records.sort_by(|a, b| a.item_id.cmp(&b.item_id));
                let _ = reply.send(records);
            }
            ItemStoreCommand::Upsert {
                item_id,
                bookmarked_item_id,
                source,
                patch,
                reply,
            } => {
                let record = handle_upsert(&mut state, &item_id, &bookmarked_item_id, &source, patch);
                let result = state.persist().map(|_| record);
                let _ = reply.send(result);
            }
            ItemStoreCommand::SetOutcome {
                item_id,
                phase,
                complete,
                error,
                reply,
            } => {
                let result = match state.items.get_mut(&item_id) {
                    None => Err(KbaError::Storage(format!("item {item_id} not found"))),
                    Some(record) => match record.outcome_mut(phase) {
                        None => Err(KbaError::Other(format!("phase {phase} has no per-item outcome"))),
                        Some(outcome) => {
                            outcome.complete = complete;
                            outcome.succeeded_this_run = complete && error.is_none();
                            outcome.error = error;
                            record.updated_at = Utc::now();
                            Ok(())
                        }
                    },
                };
                let result = result.and_then(|_| state.persist());
                let _ = reply.send(result);
            }
            ItemStoreCommand::ClearRuntimeFlags { item_id, reply } => {
                let result = match state.items.get_mut(&item_id) {
                    None => Err(KbaError::Storage(format!("item {item_id} not found"))),
                    Some(record) => {
                        clear_runtime_flags(record);
                        Ok(())
                    }
                };
                let result = result.and_then(|_| state.persist());
                let _ = reply.send(result);
            }
            ItemStoreCommand::RecordRetryAttempt {
                item_id,
                failure_type,
                error_message,
                delay_seconds,
                next_retry_after,
                reply,
            } => {
                let result = match state.items.get_mut(&item_id) {
                    None => Err(KbaError::Storage(format!("item {item_id} not found"))),
                    Some(record) => {
                        handle_record_retry_attempt(record, failure_type, error_message, delay_seconds, next_retry_after);
                        Ok(())
                    }
                };
                let result = result.and_then(|_| state.persist());
                let _ = reply.send(result);
            }
            ItemStoreCommand::OpenCircuitBreaker { item_id, until, reply } => {
                let result = match state.items.get_mut(&item_id) {
                    None => Err(KbaError::Storage(format!("item {item_id} not found"))),
                    Some(record) => {
                        record.circuit_breaker_until = Some(until);
                        record.updated_at = Utc::now();
                        Ok(())
                    }
                };
                let result = result.and_then(|_| state.persist());
                let _ = reply.send(result);
            }
            ItemStoreCommand::ListByPredicate { predicate, reply } => {
                let mut records: Vec<ItemRecord> = state.items.values().filter(|r| predicate(r)).cloned().collect();
                records.sort_by(|a, b| a.item_id.cmp(&b.item_id));
                let _ = reply.send(records);
            }
        }
    }
}

pub fn spawn_item_store_in_memory() -> (ItemStoreHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let state = ItemStoreState {
        items: HashMap::new(),
        path: None,
    };
    let task_handle = tokio::spawn(run_item_store(rx, state));
    (ItemStoreHandle { sender: tx }, task_handle)
}

pub fn spawn_item_store(path: PathBuf) -> Result<(ItemStoreHandle, tokio::task::JoinHandle<()>), KbaError> {
    let items = load_items(&path)?;
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let state = ItemStoreState { items, path: Some(path) };
    let task_handle = tokio::spawn(run_item_store(rx, state));
    Ok((ItemStoreHandle { sender: tx }, task_handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_merges() {
        let (handle, _task) = spawn_item_store_in_memory();

        let patch = ItemPatch {
            display_title: Some("first".to_string()),
            ..Default::default()
        };
        let record = handle.upsert("A", "bm-A", "bookmarks", patch).await.unwrap();
        assert_eq!(record.display_title, "first");

        let patch2 = ItemPatch {
            full_text: Some("body".to_string()),
            ..Default::default()
        };
        let record2 = handle.upsert("A", "bm-A", "bookmarks", patch2).await.unwrap();
        assert_eq!(record2.display_title, "first");
        assert_eq!(record2.full_text, "body");
    }

    #[tokio::test]
    async fn set_outcome_on_global_phase_errors() {
        let (handle, _task) = spawn_item_store_in_memory();
        handle.upsert("A", "bm-A", "bookmarks", ItemPatch::default()).await.unwrap();

        let result = handle.set_outcome("A", ProcessingPhase::Synthesis, true, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn record_retry_attempt_bounds_history() {
        let (handle, _task) = spawn_item_store_in_memory();
        handle.upsert("A", "bm-A", "bookmarks", ItemPatch::default()).await.unwrap();

        for _ in 0..(RETRY_HISTORY_CAPACITY + 5) {
            handle
                .record_retry_attempt("A", FailureType::NetworkError, "boom", 1.0, Utc::now())
                .await
                .unwrap();
        }

        let record = handle.get("A").await.unwrap().unwrap();
        assert_eq!(record.retry_history.len(), RETRY_HISTORY_CAPACITY);
        assert_eq!(record.retry_count, (RETRY_HISTORY_CAPACITY + 5) as u32);
    }

    #[tokio::test]
    async fn clear_runtime_flags_leaves_completion_state() {
        let (handle, _task) = spawn_item_store_in_memory();
        let patch = ItemPatch {
            force_recache: Some(true),
            ..Default::default()
        };
        handle.upsert("A", "bm-A", "bookmarks", patch).await.unwrap();
        handle.set_outcome("A", ProcessingPhase::Cache, true, None).await.unwrap();

        handle.clear_runtime_flags("A").await.unwrap();

        let record = handle.get("A").await.unwrap().unwrap();
        assert!(!record.force_recache);
        assert!(record.cache.complete);
    }

    #[tokio::test]
    async fn list_by_predicate_filters() {
        let (handle, _task) = spawn_item_store_in_memory();
        handle.upsert("A", "bm-A", "bookmarks", ItemPatch::default()).await.unwrap();
        handle.upsert("B", "bm-B", "bookmarks", ItemPatch::default()).await.unwrap();
        handle.set_outcome("A", ProcessingPhase::Cache, true, None).await.unwrap();

        let cached = handle.list_by_predicate(|r| r.cache.complete).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].item_id, "A");
    }

    #[tokio::test]
    async fn persists_and_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");

        let (handle, task) = spawn_item_store(path.clone()).unwrap();
        handle.upsert("A", "bm-A", "bookmarks", ItemPatch::default()).await.unwrap();
        drop(handle);
        let _ = task.await;

        let (handle2, _task2) = spawn_item_store(path).unwrap();
        let record = handle2.get("A").await.unwrap();
        assert!(record.is_some());
    }
}
