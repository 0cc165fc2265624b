//! Drives a single run through the seven top-level [`RunPhase`]s, fanning
//! `ContentProcessing` out into its five per-item sub-phases and the two
//! global phases into single whole-corpus jobs.
//!
//! This is the single task that owns an [`EtcEstimator`] end to end, submits jobs to
//! [`TaskRuntime`](crate::task_runtime), polls them to completion the same
//! way `task_runtime.rs`'s own tests do, and publishes
//! [`EventBus`](crate::event_bus) updates as it goes. A per-item phase
//! resolves its [`ModelRouter`] target once, not once per item; a
//! `KbaError::Capability`/`KbaError::ModelRouter` resolution failure is
//! folded into the phase's failure count so the usual failure-rate breach
//! path aborts the run rather than needing a separate short-circuit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::KbaError;
use crate::event_bus::{AgentProgressEvent, AgentRunCompletedEvent, EventBus, LogLevel, LogMessageEvent, PhaseStatus, PhaseUpdateEvent, RunResultsSummary, PhaseOutcomeCounts};
use crate::etc_estimator::EtcEstimator;
use crate::item_store::ItemStoreHandle;
use crate::model_router::{ModelBackend, ModelRouter, ResolvedTarget};
use crate::phase_planner::{ForceFlags, GlobalTrigger, PhasePlanner};
use crate::retry_manager::{classify_error, RetryManager};
use crate::stats_store::StatsStore;
use crate::task_runtime::{JobContext, JobFuture, JobQueue, JobRunner, JobSpec, TaskRuntimeHandle};
use crate::types::{CategoriesStructured, ItemPatch, ItemRecord, MediaRef, ProcessingPhase, RunPhase, TaskStatus, TaskType};

/// A single newly-discovered bookmark, as reported by a [`ContentFetcher`].
/// `raw_content` is opaque to this crate; the Cache phase is what interprets it.
#[derive(Clone, Debug)]
pub struct FetchedBookmark {
    pub item_id: String,
    pub bookmarked_item_id: String,
    pub source: String,
    pub raw_content: serde_json::Value,
}

/// Pulls newly bookmarked items from whatever source feeds this crate
/// (a social bookmarking API, an RSS reader, a browser export). No concrete
/// implementation is in scope here beyond a no-op; wiring a real one is an
/// external-interface concern (see the external interfaces section).
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_new_bookmarks(&self) -> Result<Vec<FetchedBookmark>, KbaError>;
}

#[async_trait]
pub trait ReadmeGenerator: Send + Sync {
    async fn generate(&self) -> Result<(), KbaError>;
}

#[async_trait]
pub trait GitSyncer: Send + Sync {
    async fn sync(&self) -> Result<(), KbaError>;
}

pub struct NoOpContentFetcher;

#[async_trait]
impl ContentFetcher for NoOpContentFetcher {
    async fn fetch_new_bookmarks(&self) -> Result<Vec<FetchedBookmark>, KbaError> {
        Ok(Vec::new())
    }
}

pub struct NoOpReadmeGenerator;

#[async_trait]
impl ReadmeGenerator for NoOpReadmeGenerator {
    async fn generate(&self) -> Result<(), KbaError> {
        Ok(())
    }
}

pub struct NoOpGitSyncer;

#[async_trait]
impl GitSyncer for NoOpGitSyncer {
    async fn sync(&self) -> Result<(), KbaError> {
        Ok(())
    }
}

/// Everything the engine needs for a run, gathered in one place so `main.rs`
/// and tests can assemble it without a long constructor argument list.
///
/// Cloneable: every field is itself a handle or `Arc`, so
/// [`AgentController`](crate::controller::AgentController) keeps one
/// template around and clones it to build a fresh [`PipelineEngine`] per run
/// rather than threading constructor arguments through every `start()` call.
#[derive(Clone)]
pub struct PipelineDeps {
    pub item_store: ItemStoreHandle,
    pub stats: Arc<StatsStore>,
    pub task_runtime: TaskRuntimeHandle,
    pub retry_manager: RetryManager,
    pub model_router: Arc<ModelRouter>,
    pub backend: Arc<dyn ModelBackend>,
    pub event_bus: EventBus,
    pub content_fetcher: Arc<dyn ContentFetcher>,
    pub readme_generator: Arc<dyn ReadmeGenerator>,
    pub git_syncer: Arc<dyn GitSyncer>,
    pub runtime_config: RuntimeConfig,
    pub kb_root: PathBuf,
}

pub struct PipelineEngine {
    deps: PipelineDeps,
    etc: EtcEstimator,
}

fn run_phase_for(phase: ProcessingPhase) -> RunPhase {
    match phase {
        ProcessingPhase::Cache | ProcessingPhase::Media | ProcessingPhase::Llm | ProcessingPhase::KbItem | ProcessingPhase::DbSync => {
            RunPhase::ContentProcessing
        }
        ProcessingPhase::Synthesis => RunPhase::SynthesisGeneration,
        ProcessingPhase::Embedding => RunPhase::EmbeddingGeneration,
    }
}

fn queue_for_phase(phase: ProcessingPhase) -> JobQueue {
    match phase {
        ProcessingPhase::Cache => JobQueue::ContentFetching,
        ProcessingPhase::Media | ProcessingPhase::Llm => JobQueue::AiProcessing,
        ProcessingPhase::KbItem | ProcessingPhase::DbSync => JobQueue::Default,
        ProcessingPhase::Synthesis | ProcessingPhase::Embedding => JobQueue::Synthesis,
    }
}

fn phase_requires_model(phase: ProcessingPhase) -> bool {
    matches!(phase, ProcessingPhase::Media | ProcessingPhase::Llm | ProcessingPhase::Synthesis | ProcessingPhase::Embedding)
}

fn slugify(input: &str) -> String {
    let mut slug: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "item".to_string()
    } else {
        trimmed.to_string()
    }
}

fn extract_cache_fields(raw: &serde_json::Value) -> (String, String, bool, Vec<serde_json::Value>, Vec<MediaRef>) {
    let display_title = raw.get("title").and_then(|v| v.as_str()).unwrap_or("Untitled").to_string();
    let full_text = raw.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let is_thread = raw.get("is_thread").and_then(|v| v.as_bool()).unwrap_or(false);
    let thread_items = raw.get("thread_items").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let media_refs = raw
        .get("media")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let media_type = m.get("media_type")?.as_str()?.to_string();
                    let url = m.get("url")?.as_str()?.to_string();
                    Some(MediaRef {
                        media_type,
                        url,
                        local_path: None,
                        alt_text: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    (display_title, full_text, is_thread, thread_items, media_refs)
}

/// On job failure: classify the error, either schedule an item-level retry
/// (recording the backoff `RetryManager` computes) or trip the circuit
/// breaker if the error isn't retryable, and mark the phase outcome failed.
/// This is a second, slower-moving retry layer on top of `TaskRuntime`'s own
/// immediate job-retry budget: that one covers transient in-process retries,
/// this one carries backoff state across runs.
async fn record_job_failure(
    item_store: &ItemStoreHandle,
    retry_manager: &RetryManager,
    event_bus: &EventBus,
    task_id: Uuid,
    item_id: &str,
    phase: ProcessingPhase,
    err: &KbaError,
) {
    let message = err.to_string();
    let failure_type = classify_error(err);

    if let Ok(Some(record)) = item_store.get(item_id).await {
        if retry_manager.should_retry(&record, failure_type) {
            let mut projected = record.clone();
            retry_manager.schedule_retry(&mut projected, message.clone());
            if let Some(attempt) = projected.retry_history.back() {
                let _ = item_store
                    .record_retry_attempt(
                        item_id,
                        failure_type,
                        &message,
                        attempt.delay_seconds,
                        projected.next_retry_after.unwrap_or_else(Utc::now),
                    )
                    .await;
            }
        } else {
            let minutes = retry_manager.config().circuit_breaker_minutes;
            let _ = item_store.open_circuit_breaker(item_id, Utc::now() + ChronoDuration::minutes(minutes)).await;
        }
    }

    let _ = item_store.set_outcome(item_id, phase, false, Some(message.clone())).await;

    // Per-item errors are inlined into the run's event stream rather than
    // aborting the phase; `log_message` carries the full text, while
    // `agent_progress_update` carries a shorter `item_id: message` summary
    // for UIs that only render the progress channel.
    event_bus.publish_log_message(LogMessageEvent {
        level: LogLevel::Warn,
        module: format!("pipeline_engine::{phase}"),
        message: format!("item {item_id} failed: {message}"),
        task_id: Some(task_id),
        timestamp: Utc::now(),
    });
    event_bus.publish_agent_progress(AgentProgressEvent {
        task_id,
        current: 0,
        total: 0,
        phase: Some(run_phase_for(phase).as_str().to_string()),
        message: Some(format!("{item_id}: {message}")),
        timestamp: Utc::now(),
    });
}

async fn run_cache(item_store: &ItemStoreHandle, item_id: &str) -> Result<(), KbaError> {
    let record = item_store
        .get(item_id)
        .await?
        .ok_or_else(|| KbaError::Storage(format!("item {item_id} vanished before caching")))?;
    let (display_title, full_text, is_thread, thread_items, media_refs) = extract_cache_fields(&record.raw_content);
    let patch = ItemPatch {
        display_title: Some(display_title),
        full_text: Some(full_text),
        is_thread: Some(is_thread),
        thread_items: Some(thread_items),
        media_refs: Some(media_refs),
        ..Default::default()
    };
    item_store.upsert(item_id, &record.bookmarked_item_id, &record.source, patch).await?;
    item_store.set_outcome(item_id, ProcessingPhase::Cache, true, None).await?;
    Ok(())
}

async fn run_media(item_store: &ItemStoreHandle, item_id: &str, backend: &Arc<dyn ModelBackend>, target: &ResolvedTarget, timeout: Duration) -> Result<(), KbaError> {
    let record = item_store
        .get(item_id)
        .await?
        .ok_or_else(|| KbaError::Storage(format!("item {item_id} vanished before media processing")))?;
    let mut refs = record.media_refs.clone();
    for media_ref in refs.iter_mut() {
        if media_ref.alt_text.is_some() {
            continue;
        }
        let prompt = format!("Describe the media at {} for accessibility alt text.", media_ref.url);
        let result = backend.run(target, &prompt, timeout).await?;
        media_ref.alt_text = Some(result.output);
        media_ref.local_path = Some(media_ref.url.clone());
    }
    item_store
        .upsert(
            item_id,
            &record.bookmarked_item_id,
            &record.source,
            ItemPatch {
                media_refs: Some(refs),
                ..Default::default()
            },
        )
        .await?;
    item_store.set_outcome(item_id, ProcessingPhase::Media, true, None).await?;
    Ok(())
}

async fn run_llm(item_store: &ItemStoreHandle, item_id: &str, backend: &Arc<dyn ModelBackend>, target: &ResolvedTarget, timeout: Duration) -> Result<(), KbaError> {
    let record = item_store
        .get(item_id)
        .await?
        .ok_or_else(|| KbaError::Storage(format!("item {item_id} vanished before categorization")))?;

    let prompt = format!(
        "Classify the following content into a main category, optional sub category, a concise item name, and a categories breakdown.\n\n{}",
        record.full_text
    );
    let result = backend.run(target, &prompt, timeout).await?;
    let structured = result
        .structured
        .ok_or_else(|| KbaError::Data("llm backend returned no structured categorization".to_string()))?;

    let main_category = structured.get("main_category").and_then(|v| v.as_str()).map(|s| s.to_string());
    let item_name_suggestion = structured.get("item_name_suggestion").and_then(|v| v.as_str()).map(|s| s.to_string());
    if main_category.is_none() || item_name_suggestion.is_none() {
        return Err(KbaError::Data("llm backend result missing main_category or item_name_suggestion".to_string()));
    }
    let sub_category = structured.get("sub_category").and_then(|v| v.as_str()).map(|s| s.to_string());
    let categories = structured.get("categories").map(|v| CategoriesStructured {
        main: v.get("main").and_then(|m| m.as_str()).unwrap_or_default().to_string(),
        sub: v
            .get("sub")
            .and_then(|s| s.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default(),
    });

    let patch = ItemPatch {
        main_category: Some(main_category),
        sub_category: Some(sub_category),
        item_name_suggestion: Some(item_name_suggestion),
        categories: Some(categories),
        ..Default::default()
    };
    item_store.upsert(item_id, &record.bookmarked_item_id, &record.source, patch).await?;
    item_store.set_outcome(item_id, ProcessingPhase::Llm, true, None).await?;
    Ok(())
}

async fn run_kb_item(item_store: &ItemStoreHandle, item_id: &str, kb_root: &PathBuf) -> Result<(), KbaError> {
    let record = item_store
        .get(item_id)
        .await?
        .ok_or_else(|| KbaError::Storage(format!("item {item_id} vanished before kb item creation")))?;

    let category = record.main_category.clone().unwrap_or_else(|| "uncategorized".to_string());
    let slug = slugify(record.item_name_suggestion.as_deref().unwrap_or(&record.item_id));
    let dir = kb_root.join(slugify(&category));
    tokio::fs::create_dir_all(&dir).await.map_err(|e| KbaError::Storage(e.to_string()))?;
    let file_path = dir.join(format!("{slug}.md"));

    let mut body = format!("# {}\n\n{}\n", record.display_title, record.full_text);
    let mut media_paths = Vec::new();
    for media in &record.media_refs {
        if let Some(local_path) = &media.local_path {
            body.push_str(&format!("\n![{}]({})\n", media.alt_text.clone().unwrap_or_default(), local_path));
            media_paths.push(local_path.clone());
        }
    }
    tokio::fs::write(&file_path, body).await.map_err(|e| KbaError::Storage(e.to_string()))?;

    let patch = ItemPatch {
        kb_item_path: Some(Some(file_path.display().to_string())),
        kb_media_paths: Some(media_paths),
        ..Default::default()
    };
    item_store.upsert(item_id, &record.bookmarked_item_id, &record.source, patch).await?;
    item_store.set_outcome(item_id, ProcessingPhase::KbItem, true, None).await?;
    Ok(())
}

async fn run_db_sync(item_store: &ItemStoreHandle, item_id: &str) -> Result<(), KbaError> {
    let record = item_store
        .get(item_id)
        .await?
        .ok_or_else(|| KbaError::Storage(format!("item {item_id} vanished before db sync")))?;
    tracing::info!(item_id = %record.item_id, kb_item_path = ?record.kb_item_path, "synced item to external store");
    item_store.set_outcome(item_id, ProcessingPhase::DbSync, true, None).await?;
    Ok(())
}

fn cache_job(item_store: ItemStoreHandle, retry_manager: RetryManager, event_bus: EventBus, item_id: String) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let retry_manager = retry_manager.clone();
        let event_bus = event_bus.clone();
        let item_id = item_id.clone();
        Box::pin(async move {
            ctx.heartbeat().await;
            let result = run_cache(&item_store, &item_id).await;
            if let Err(err) = &result {
                record_job_failure(&item_store, &retry_manager, &event_bus, ctx.task_id(), &item_id, ProcessingPhase::Cache, err).await;
            }
            result
        })
    })
}

fn media_job(item_store: ItemStoreHandle, retry_manager: RetryManager, event_bus: EventBus, item_id: String, backend: Arc<dyn ModelBackend>, target: ResolvedTarget, timeout: Duration) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let retry_manager = retry_manager.clone();
        let event_bus = event_bus.clone();
        let item_id = item_id.clone();
        let backend = backend.clone();
        let target = target.clone();
        Box::pin(async move {
            ctx.heartbeat().await;
            let result = run_media(&item_store, &item_id, &backend, &target, timeout).await;
            if let Err(err) = &result {
                record_job_failure(&item_store, &retry_manager, &event_bus, ctx.task_id(), &item_id, ProcessingPhase::Media, err).await;
            }
            result
        })
    })
}

fn llm_job(item_store: ItemStoreHandle, retry_manager: RetryManager, event_bus: EventBus, item_id: String, backend: Arc<dyn ModelBackend>, target: ResolvedTarget, timeout: Duration) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let retry_manager = retry_manager.clone();
        let event_bus = event_bus.clone();
        let item_id = item_id.clone();
        let backend = backend.clone();
        let target = target.clone();
        Box::pin(async move {
            ctx.heartbeat().await;
            let result = run_llm(&item_store, &item_id, &backend, &target, timeout).await;
            if let Err(err) = &result {
                record_job_failure(&item_store, &retry_manager, &event_bus, ctx.task_id(), &item_id, ProcessingPhase::Llm, err).await;
            }
            result
        })
    })
}

fn kb_item_job(item_store: ItemStoreHandle, retry_manager: RetryManager, event_bus: EventBus, item_id: String, kb_root: PathBuf) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let retry_manager = retry_manager.clone();
        let event_bus = event_bus.clone();
        let item_id = item_id.clone();
        let kb_root = kb_root.clone();
        Box::pin(async move {
            ctx.heartbeat().await;
            let result = run_kb_item(&item_store, &item_id, &kb_root).await;
            if let Err(err) = &result {
                record_job_failure(&item_store, &retry_manager, &event_bus, ctx.task_id(), &item_id, ProcessingPhase::KbItem, err).await;
            }
            result
        })
    })
}

fn db_sync_job(item_store: ItemStoreHandle, retry_manager: RetryManager, event_bus: EventBus, item_id: String) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let retry_manager = retry_manager.clone();
        let event_bus = event_bus.clone();
        let item_id = item_id.clone();
        Box::pin(async move {
            ctx.heartbeat().await;
            let result = run_db_sync(&item_store, &item_id).await;
            if let Err(err) = &result {
                record_job_failure(&item_store, &retry_manager, &event_bus, ctx.task_id(), &item_id, ProcessingPhase::DbSync, err).await;
            }
            result
        })
    })
}

fn synthesis_job(item_store: ItemStoreHandle, backend: Arc<dyn ModelBackend>, target: ResolvedTarget, timeout: Duration, kb_root: PathBuf) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let backend = backend.clone();
        let target = target.clone();
        let kb_root = kb_root.clone();
        Box::pin(async move {
            let items = item_store.list_all().await?;
            let total = items.len() as u64;
            let mut corpus = String::new();
            for (i, item) in items.iter().enumerate() {
                if ctx.is_cancelled() {
                    return Err(KbaError::Cancelled);
                }
                corpus.push_str(&format!("- {} ({})\n", item.display_title, item.main_category.clone().unwrap_or_default()));
                ctx.report_progress((i + 1) as u64, total).await;
            }
            let prompt = format!("Write a short synthesis summarizing themes across this knowledge base:\n\n{corpus}");
            let result = backend.run(&target, &prompt, timeout).await?;
            tokio::fs::create_dir_all(&kb_root).await.map_err(|e| KbaError::Storage(e.to_string()))?;
            tokio::fs::write(kb_root.join("SYNTHESIS.md"), result.output)
                .await
                .map_err(|e| KbaError::Storage(e.to_string()))?;
            Ok(())
        })
    })
}

fn embedding_job(item_store: ItemStoreHandle, backend: Arc<dyn ModelBackend>, target: ResolvedTarget, timeout: Duration, kb_root: PathBuf) -> JobRunner {
    Arc::new(move |ctx: JobContext| -> JobFuture {
        let item_store = item_store.clone();
        let backend = backend.clone();
        let target = target.clone();
        let kb_root = kb_root.clone();
        Box::pin(async move {
            let items = item_store.list_all().await?;
            let total = items.len() as u64;
            let mut index = serde_json::Map::new();
            for (i, item) in items.iter().enumerate() {
                if ctx.is_cancelled() {
                    return Err(KbaError::Cancelled);
                }
                if !item.full_text.is_empty() {
                    let result = backend.run(&target, &item.full_text, timeout).await?;
                    let value = result.structured.unwrap_or_else(|| serde_json::Value::String(result.output));
                    index.insert(item.item_id.clone(), value);
                }
                ctx.report_progress((i + 1) as u64, total).await;
            }
            tokio::fs::create_dir_all(&kb_root).await.map_err(|e| KbaError::Storage(e.to_string()))?;
            let json = serde_json::to_string_pretty(&serde_json::Value::Object(index)).map_err(|e| KbaError::Data(e.to_string()))?;
            tokio::fs::write(kb_root.join("embeddings.json"), json).await.map_err(|e| KbaError::Storage(e.to_string()))?;
            Ok(())
        })
    })
}

impl PipelineEngine {
    pub fn new(deps: PipelineDeps) -> Self {
        PipelineEngine { deps, etc: EtcEstimator::new() }
    }

    fn publish_run_phase_event(&self, task_id: Uuid, run_phase: RunPhase, status: PhaseStatus) {
        self.deps.event_bus.publish_phase_update(PhaseUpdateEvent {
            task_id,
            run_phase,
            processing_phase: None,
            status,
            progress: None,
            timestamp: Utc::now(),
        });
    }

    fn publish_sub_phase_event(&self, task_id: Uuid, phase: ProcessingPhase, status: PhaseStatus) {
        self.deps.event_bus.publish_phase_update(PhaseUpdateEvent {
            task_id,
            run_phase: run_phase_for(phase),
            processing_phase: Some(phase),
            status,
            progress: None,
            timestamp: Utc::now(),
        });
    }

    async fn build_job_for_phase(&self, phase: ProcessingPhase, item_id: String, target: Option<ResolvedTarget>) -> JobRunner {
        match phase {
            ProcessingPhase::Cache => cache_job(self.deps.item_store.clone(), self.deps.retry_manager.clone(), self.deps.event_bus.clone(), item_id),
            ProcessingPhase::Media => media_job(
                self.deps.item_store.clone(),
                self.deps.retry_manager.clone(),
                self.deps.event_bus.clone(),
                item_id,
                self.deps.backend.clone(),
                target.expect("media phase requires a resolved model target"),
                Duration::from_secs(self.deps.runtime_config.vision_timeout_seconds),
            ),
            ProcessingPhase::Llm => llm_job(
                self.deps.item_store.clone(),
                self.deps.retry_manager.clone(),
                self.deps.event_bus.clone(),
                item_id,
                self.deps.backend.clone(),
                target.expect("llm phase requires a resolved model target"),
                Duration::from_secs(self.deps.runtime_config.text_timeout_seconds),
            ),
            ProcessingPhase::KbItem => kb_item_job(self.deps.item_store.clone(), self.deps.retry_manager.clone(), self.deps.event_bus.clone(), item_id, self.deps.kb_root.clone()),
            ProcessingPhase::DbSync => db_sync_job(self.deps.item_store.clone(), self.deps.retry_manager.clone(), self.deps.event_bus.clone(), item_id),
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => unreachable!("global phases are built by run_global_phase"),
        }
    }

    /// Poll every task id to a terminal state, publishing progress as they
    /// land and updating the (single-owner) ETC estimator. On cancellation,
    /// asks every still-pending task to cancel before returning.
    async fn poll_until_done(&mut self, task_id: Uuid, run_phase: RunPhase, processing_phase: ProcessingPhase, task_ids: &[Uuid], cancel: &CancellationToken) -> (u64, u64) {
        let mut pending: Vec<Uuid> = task_ids.to_vec();
        let total = task_ids.len() as u64;
        let mut succeeded = 0u64;
        let mut failed = 0u64;
        let poll_interval = Duration::from_millis(self.deps.runtime_config.progress_poll_interval_ms);

        loop {
            if cancel.is_cancelled() {
                for id in &pending {
                    self.deps.task_runtime.cancel(*id).await;
                }
                break;
            }

            let mut still_pending = Vec::new();
            let mut last_failure_message = None;
            for id in pending {
                match self.deps.task_runtime.status(id).await {
                    Some(state) if state.status.is_terminal() => match state.status {
                        TaskStatus::Success => succeeded += 1,
                        _ => {
                            failed += 1;
                            if let Some(err) = &state.error {
                                last_failure_message = Some(err.clone());
                            }
                        }
                    },
                    _ => still_pending.push(id),
                }
            }
            pending = still_pending;

            let processed = total - pending.len() as u64;
            self.etc.update(processing_phase, processed, None);
            self.deps.event_bus.publish_agent_progress(AgentProgressEvent {
                task_id,
                current: processed,
                total,
                phase: Some(run_phase.as_str().to_string()),
                message: last_failure_message,
                timestamp: Utc::now(),
            });

            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }

        (succeeded, failed)
    }

    async fn run_item_phase(&mut self, phase: ProcessingPhase, task_id: Uuid, cancel: &CancellationToken, force: &ForceFlags) -> PhaseOutcomeCounts {
        let run_phase = run_phase_for(phase);

        let items = match self.deps.item_store.list_all().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, phase = %phase, "failed to list items for phase");
                return PhaseOutcomeCounts { attempted: 1, succeeded: 0, failed: 1, skipped: 0 };
            }
        };
        let map: HashMap<String, ItemRecord> = items.into_iter().map(|r| (r.item_id.clone(), r)).collect();
        let plan = PhasePlanner::plan_for_phase(phase, &map, force, &GlobalTrigger::default());

        self.publish_sub_phase_event(task_id, phase, PhaseStatus::Started);

        if plan.should_skip_phase() {
            self.publish_sub_phase_event(task_id, phase, PhaseStatus::Skipped);
            return PhaseOutcomeCounts {
                attempted: 0,
                succeeded: 0,
                failed: 0,
                skipped: (plan.already_complete.len() + plan.ineligible.len()) as u64,
            };
        }

        let target = if phase_requires_model(phase) {
            match self.deps.model_router.resolve(phase.as_str(), None) {
                Ok(target) => Some(target),
                Err(e) => {
                    tracing::error!(error = %e, phase = %phase, "model router resolution failed; failing phase");
                    self.publish_sub_phase_event(task_id, phase, PhaseStatus::Failed);
                    return PhaseOutcomeCounts {
                        attempted: plan.needs_processing.len() as u64,
                        succeeded: 0,
                        failed: plan.needs_processing.len() as u64,
                        skipped: (plan.already_complete.len() + plan.ineligible.len()) as u64,
                    };
                }
            }
        } else {
            None
        };

        self.etc.init(phase, plan.needs_processing.len() as u64, &self.deps.stats);

        let mut task_ids = Vec::with_capacity(plan.needs_processing.len());
        for item_id in &plan.needs_processing {
            let run = self.build_job_for_phase(phase, item_id.clone(), target.clone()).await;
            let job_task_id = self
                .deps
                .task_runtime
                .submit(JobSpec {
                    queue: queue_for_phase(phase),
                    task_type: TaskType::ItemBatch,
                    phase: Some(phase.as_str().to_string()),
                    parent_task_id: Some(task_id),
                    run,
                })
                .await;
            task_ids.push(job_task_id);
        }

        let (succeeded, failed) = self.poll_until_done(task_id, run_phase, phase, &task_ids, cancel).await;
        self.etc.finalize(phase, &self.deps.stats).await;

        let status = if cancel.is_cancelled() {
            PhaseStatus::Cancelled
        } else if failed > 0 && (failed as f64 / task_ids.len().max(1) as f64) > self.deps.runtime_config.failure_rate_threshold {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Completed
        };
        self.publish_sub_phase_event(task_id, phase, status);

        PhaseOutcomeCounts {
            attempted: task_ids.len() as u64,
            succeeded,
            failed,
            skipped: (plan.already_complete.len() + plan.ineligible.len()) as u64,
        }
    }

    async fn run_global_phase(&mut self, phase: ProcessingPhase, task_id: Uuid, cancel: &CancellationToken, trigger: &GlobalTrigger) -> PhaseOutcomeCounts {
        let items = match self.deps.item_store.list_all().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, phase = %phase, "failed to list items for global phase");
                return PhaseOutcomeCounts { attempted: 1, succeeded: 0, failed: 1, skipped: 0 };
            }
        };
        let map: HashMap<String, ItemRecord> = items.iter().map(|r| (r.item_id.clone(), r.clone())).collect();
        let plan = PhasePlanner::plan_for_phase(phase, &map, &ForceFlags::default(), trigger);

        self.publish_sub_phase_event(task_id, phase, PhaseStatus::Started);

        if plan.should_skip_phase() {
            self.publish_sub_phase_event(task_id, phase, PhaseStatus::Skipped);
            return PhaseOutcomeCounts { attempted: 0, succeeded: 0, failed: 0, skipped: 1 };
        }

        let target = match self.deps.model_router.resolve(phase.as_str(), None) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!(error = %e, phase = %phase, "model router resolution failed for global phase");
                self.publish_sub_phase_event(task_id, phase, PhaseStatus::Failed);
                return PhaseOutcomeCounts { attempted: 1, succeeded: 0, failed: 1, skipped: 0 };
            }
        };

        let run = match phase {
            ProcessingPhase::Synthesis => synthesis_job(
                self.deps.item_store.clone(),
                self.deps.backend.clone(),
                target,
                Duration::from_secs(self.deps.runtime_config.text_timeout_seconds),
                self.deps.kb_root.clone(),
            ),
            ProcessingPhase::Embedding => embedding_job(
                self.deps.item_store.clone(),
                self.deps.backend.clone(),
                target,
                Duration::from_secs(self.deps.runtime_config.text_timeout_seconds),
                self.deps.kb_root.clone(),
            ),
            _ => unreachable!("run_global_phase called with a non-global phase"),
        };

        self.etc.init(phase, map.len() as u64, &self.deps.stats);
        let submitted = self
            .deps
            .task_runtime
            .submit(JobSpec {
                queue: queue_for_phase(phase),
                task_type: TaskType::PhaseExecution,
                phase: Some(phase.as_str().to_string()),
                parent_task_id: Some(task_id),
                run,
            })
            .await;

        let (succeeded, failed) = self.poll_until_done(task_id, run_phase_for(phase), phase, std::slice::from_ref(&submitted), cancel).await;
        self.etc.finalize(phase, &self.deps.stats).await;

        let status = if cancel.is_cancelled() {
            PhaseStatus::Cancelled
        } else if failed > 0 {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Completed
        };
        self.publish_sub_phase_event(task_id, phase, status);

        PhaseOutcomeCounts { attempted: 1, succeeded, failed, skipped: 0 }
    }

    async fn run_content_processing(&mut self, task_id: Uuid, cancel: &CancellationToken, force: &ForceFlags) -> PhaseOutcomeCounts {
        let mut total = PhaseOutcomeCounts::default();
        for phase in [
            ProcessingPhase::Cache,
            ProcessingPhase::Media,
            ProcessingPhase::Llm,
            ProcessingPhase::KbItem,
            ProcessingPhase::DbSync,
        ] {
            if cancel.is_cancelled() {
                break;
            }
            let counts = self.run_item_phase(phase, task_id, cancel, force).await;
            let breach = counts.attempted > 0 && (counts.failed as f64 / counts.attempted as f64) > self.deps.runtime_config.failure_rate_threshold;

            total.attempted += counts.attempted;
            total.succeeded += counts.succeeded;
            total.failed += counts.failed;
            total.skipped += counts.skipped;

            if breach {
                break;
            }
        }
        total
    }

    async fn run_initialization(&self, task_id: Uuid) -> PhaseOutcomeCounts {
        self.publish_run_phase_event(task_id, RunPhase::Initialization, PhaseStatus::Completed);
        PhaseOutcomeCounts::default()
    }

    async fn run_fetch_bookmarks(&mut self, task_id: Uuid) -> (PhaseOutcomeCounts, usize) {
        self.publish_run_phase_event(task_id, RunPhase::FetchBookmarks, PhaseStatus::Started);
        match self.deps.content_fetcher.fetch_new_bookmarks().await {
            Ok(fetched) => {
                let count = fetched.len();
                for bookmark in &fetched {
                    let patch = ItemPatch {
                        raw_content: Some(bookmark.raw_content.clone()),
                        ..Default::default()
                    };
                    let _ = self
                        .deps
                        .item_store
                        .upsert(&bookmark.item_id, &bookmark.bookmarked_item_id, &bookmark.source, patch)
                        .await;
                }
                self.publish_run_phase_event(task_id, RunPhase::FetchBookmarks, PhaseStatus::Completed);
                (
                    PhaseOutcomeCounts {
                        attempted: count as u64,
                        succeeded: count as u64,
                        failed: 0,
                        skipped: 0,
                    },
                    count,
                )
            }
            Err(e) => {
                tracing::error!(error = %e, "fetch bookmarks failed");
                self.publish_run_phase_event(task_id, RunPhase::FetchBookmarks, PhaseStatus::Failed);
                (PhaseOutcomeCounts { attempted: 1, succeeded: 0, failed: 1, skipped: 0 }, 0)
            }
        }
    }

    async fn run_readme_generation(&self, task_id: Uuid) -> PhaseOutcomeCounts {
        self.publish_run_phase_event(task_id, RunPhase::ReadmeGeneration, PhaseStatus::Started);
        match self.deps.readme_generator.generate().await {
            Ok(()) => {
                self.publish_run_phase_event(task_id, RunPhase::ReadmeGeneration, PhaseStatus::Completed);
                PhaseOutcomeCounts { attempted: 1, succeeded: 1, failed: 0, skipped: 0 }
            }
            Err(e) => {
                tracing::error!(error = %e, "readme generation failed");
                self.publish_run_phase_event(task_id, RunPhase::ReadmeGeneration, PhaseStatus::Failed);
                PhaseOutcomeCounts { attempted: 1, succeeded: 0, failed: 1, skipped: 0 }
            }
        }
    }

    async fn run_git_sync(&self, task_id: Uuid) -> PhaseOutcomeCounts {
        self.publish_run_phase_event(task_id, RunPhase::GitSync, PhaseStatus::Started);
        match self.deps.git_syncer.sync().await {
            Ok(()) => {
                self.publish_run_phase_event(task_id, RunPhase::GitSync, PhaseStatus::Completed);
                PhaseOutcomeCounts { attempted: 1, succeeded: 1, failed: 0, skipped: 0 }
            }
            Err(e) => {
                tracing::error!(error = %e, "git sync failed");
                self.publish_run_phase_event(task_id, RunPhase::GitSync, PhaseStatus::Failed);
                PhaseOutcomeCounts { attempted: 1, succeeded: 0, failed: 1, skipped: 0 }
            }
        }
    }

    /// Runs the full seven-phase sequence once. A failure-rate breach in any
    /// phase blocks every phase after it (the sequence is a strict chain, not
    /// a DAG); a cancellation short-circuits between phases and asks any
    /// in-flight jobs of the current phase to stop.
    pub async fn run(&mut self, task_id: Uuid, cancel: CancellationToken) -> RunResultsSummary {
        let started = Utc::now();
        let mut summary = RunResultsSummary::default();
        let mut blocked = false;
        let mut new_items_since_last_run = 0usize;
        let force = ForceFlags::default();

        for run_phase in RunPhase::ORDER {
            if cancel.is_cancelled() {
                self.publish_run_phase_event(task_id, run_phase, PhaseStatus::Cancelled);
                break;
            }
            if blocked {
                self.publish_run_phase_event(task_id, run_phase, PhaseStatus::Skipped);
                continue;
            }

            let counts = match run_phase {
                RunPhase::Initialization => self.run_initialization(task_id).await,
                RunPhase::FetchBookmarks => {
                    let (counts, fetched) = self.run_fetch_bookmarks(task_id).await;
                    new_items_since_last_run = fetched;
                    counts
                }
                RunPhase::ContentProcessing => self.run_content_processing(task_id, &cancel, &force).await,
                RunPhase::SynthesisGeneration => {
                    let trigger = GlobalTrigger {
                        new_items_since_last_run,
                        min_new_items_for_synthesis: self.deps.runtime_config.min_new_items_for_synthesis,
                    };
                    self.run_global_phase(ProcessingPhase::Synthesis, task_id, &cancel, &trigger).await
                }
                RunPhase::EmbeddingGeneration => {
                    let trigger = GlobalTrigger {
                        new_items_since_last_run,
                        min_new_items_for_synthesis: self.deps.runtime_config.min_new_items_for_synthesis,
                    };
                    self.run_global_phase(ProcessingPhase::Embedding, task_id, &cancel, &trigger).await
                }
                RunPhase::ReadmeGeneration => self.run_readme_generation(task_id).await,
                RunPhase::GitSync => self.run_git_sync(task_id).await,
            };

            let breach = counts.attempted > 0 && (counts.failed as f64 / counts.attempted as f64) > self.deps.runtime_config.failure_rate_threshold;
            if breach {
                blocked = true;
            }
            summary.per_phase.insert(run_phase.as_str().to_string(), counts);
        }

        let duration_seconds = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        let success = !blocked && !cancel.is_cancelled();
        self.deps.event_bus.publish_run_completed(AgentRunCompletedEvent {
            task_id,
            success,
            duration_seconds,
            results: summary.clone(),
            timestamp: Utc::now(),
        });

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::item_store::spawn_item_store_in_memory;
    use crate::model_router::{BackendCapabilities, BackendEntry, BackendResult, MockModelBackend, PhaseRequirement};
    use crate::retry_manager::RetryConfig;
    use crate::stats_store::StatsStore;
    use crate::task_runtime::spawn_task_runtime;

    struct FixedFetcher(Vec<FetchedBookmark>);

    #[async_trait]
    impl ContentFetcher for FixedFetcher {
        async fn fetch_new_bookmarks(&self) -> Result<Vec<FetchedBookmark>, KbaError> {
            Ok(self.0.clone())
        }
    }

    fn bookmark(id: &str, text: &str) -> FetchedBookmark {
        FetchedBookmark {
            item_id: id.to_string(),
            bookmarked_item_id: format!("bm-{id}"),
            source: "bookmarks".to_string(),
            raw_content: serde_json::json!({ "title": format!("Title {id}"), "text": text }),
        }
    }

    fn categorization_result() -> BackendResult {
        BackendResult {
            output: "categorized".to_string(),
            structured: Some(serde_json::json!({
                "main_category": "engineering",
                "sub_category": "rust",
                "item_name_suggestion": "example-item",
                "categories": { "main": "engineering", "sub": ["rust"] },
            })),
        }
    }

    fn test_router() -> ModelRouter {
        let mut router = ModelRouter::new();
        let backend_entry = |vision: bool| BackendEntry {
            name: "mock".to_string(),
            model: "mock-model".to_string(),
            capabilities: BackendCapabilities {
                supports_streaming: false,
                supports_vision: vision,
                embedding_dimensions: Some(8),
            },
        };
        router.register_phase("media", backend_entry(true), PhaseRequirement { requires_vision: true, ..Default::default() });
        router.register_phase("llm", backend_entry(false), PhaseRequirement::default());
        router.register_phase("synthesis", backend_entry(false), PhaseRequirement::default());
        router.register_phase(
            "embedding",
            backend_entry(false),
            PhaseRequirement { requires_embedding: true, ..Default::default() },
        );
        router
    }

    #[tokio::test]
    async fn full_run_processes_a_fetched_item_through_every_phase() {
        let (item_store, _item_task) = spawn_item_store_in_memory();
        let (task_runtime, _runtime_task) = spawn_task_runtime();
        let stats = Arc::new(StatsStore::in_memory());
        let kb_root = tempfile::tempdir().unwrap();

        let backend: Arc<dyn ModelBackend> = Arc::new(MockModelBackend::new(vec![
            Ok(categorization_result()), // llm
            Ok(BackendResult { output: "synthesis text".to_string(), structured: None }), // synthesis
            Ok(BackendResult { output: "embedded".to_string(), structured: None }), // embedding
        ]));

        let deps = PipelineDeps {
            item_store,
            stats,
            task_runtime,
            retry_manager: RetryManager::new(RetryConfig::default()),
            model_router: Arc::new(test_router()),
            backend,
            event_bus: EventBus::new(),
            content_fetcher: Arc::new(FixedFetcher(vec![bookmark("A", "some interesting content")])),
            readme_generator: Arc::new(NoOpReadmeGenerator),
            git_syncer: Arc::new(NoOpGitSyncer),
            runtime_config: RuntimeConfig::default(),
            kb_root: kb_root.path().to_path_buf(),
        };

        let mut engine = PipelineEngine::new(deps);
        let summary = engine.run(Uuid::new_v4(), CancellationToken::new()).await;

        let content_processing = summary.per_phase.get("content_processing").unwrap();
        assert_eq!(content_processing.failed, 0);
        assert!(content_processing.succeeded > 0);

        let record = engine.deps.item_store.get("A").await.unwrap().unwrap();
        assert!(record.cache.complete);
        assert!(record.llm.complete);
        assert!(record.kb_item.complete);
        assert!(record.db_sync.complete);
        assert_eq!(record.main_category.as_deref(), Some("engineering"));
        assert!(record.kb_item_path.is_some());
    }

    #[tokio::test]
    async fn item_failure_publishes_log_message_and_progress_event() {
        let (item_store, _item_task) = spawn_item_store_in_memory();
        let (task_runtime, _runtime_task) = spawn_task_runtime();
        let stats = Arc::new(StatsStore::in_memory());
        let kb_root = tempfile::tempdir().unwrap();

        let backend: Arc<dyn ModelBackend> = Arc::new(MockModelBackend::new(vec![
            Err(KbaError::Network("connection reset".to_string())), // llm
        ]));

        let event_bus = EventBus::new();
        let mut log_rx = event_bus.subscribe_log_message();
        let mut progress_rx = event_bus.subscribe_agent_progress();

        let deps = PipelineDeps {
            item_store,
            stats,
            task_runtime,
            retry_manager: RetryManager::new(RetryConfig::default()),
            model_router: Arc::new(test_router()),
            backend,
            event_bus,
            content_fetcher: Arc::new(FixedFetcher(vec![bookmark("A", "some interesting content")])),
            readme_generator: Arc::new(NoOpReadmeGenerator),
            git_syncer: Arc::new(NoOpGitSyncer),
            runtime_config: RuntimeConfig::default(),
            kb_root: kb_root.path().to_path_buf(),
        };

        let mut engine = PipelineEngine::new(deps);
        let _summary = engine.run(Uuid::new_v4(), CancellationToken::new()).await;

        let mut saw_log = false;
        while let Ok(event) = log_rx.try_recv() {
            if event.message.contains('A') && event.message.contains("connection reset") {
                saw_log = true;
            }
        }
        assert!(saw_log, "expected a log_message naming the failed item and its error");

        let mut saw_progress = false;
        while let Ok(event) = progress_rx.try_recv() {
            if event.message.as_deref().map(|m| m.contains("connection reset")).unwrap_or(false) {
                saw_progress = true;
            }
        }
        assert!(saw_progress, "expected an agent_progress_update carrying the failure text");
    }

    #[tokio::test]
    async fn model_router_failure_blocks_the_rest_of_the_run() {
        let (item_store, _item_task) = spawn_item_store_in_memory();
        let (task_runtime, _runtime_task) = spawn_task_runtime();
        let stats = Arc::new(StatsStore::in_memory());
        let kb_root = tempfile::tempdir().unwrap();

        item_store
            .upsert(
                "A",
                "bm-A",
                "bookmarks",
                ItemPatch {
                    raw_content: Some(serde_json::json!({"title": "t", "text": "body"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let backend: Arc<dyn ModelBackend> = Arc::new(MockModelBackend::new(vec![]));

        // Router has no "media"/"llm" phases registered, so Media resolution fails.
        let deps = PipelineDeps {
            item_store,
            stats,
            task_runtime,
            retry_manager: RetryManager::new(RetryConfig::default()),
            model_router: Arc::new(ModelRouter::new()),
            backend,
            event_bus: EventBus::new(),
            content_fetcher: Arc::new(NoOpContentFetcher),
            readme_generator: Arc::new(NoOpReadmeGenerator),
            git_syncer: Arc::new(NoOpGitSyncer),
            runtime_config: RuntimeConfig::default(),
            kb_root: kb_root.path().to_path_buf(),
        };

        let mut engine = PipelineEngine::new(deps);
        let summary = engine.run(Uuid::new_v4(), CancellationToken::new()).await;

        // Synthesis/embedding/readme/git_sync must all have been skipped once
        // content_processing breached its failure threshold.
        assert_eq!(summary.per_phase.get("synthesis_generation").unwrap().attempted, 0);
        assert_eq!(summary.per_phase.get("git_sync").unwrap().attempted, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_phases() {
        let (item_store, _item_task) = spawn_item_store_in_memory();
        let (task_runtime, _runtime_task) = spawn_task_runtime();
        let stats = Arc::new(StatsStore::in_memory());
        let kb_root = tempfile::tempdir().unwrap();

        let deps = PipelineDeps {
            item_store,
            stats,
            task_runtime,
            retry_manager: RetryManager::new(RetryConfig::default()),
            model_router: Arc::new(ModelRouter::new()),
            backend: Arc::new(MockModelBackend::new(vec![])),
            event_bus: EventBus::new(),
            content_fetcher: Arc::new(NoOpContentFetcher),
            readme_generator: Arc::new(NoOpReadmeGenerator),
            git_syncer: Arc::new(NoOpGitSyncer),
            runtime_config: RuntimeConfig::default(),
            kb_root: kb_root.path().to_path_buf(),
        };

        let mut engine = PipelineEngine::new(deps);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = engine.run(Uuid::new_v4(), cancel).await;

        // Initialization runs before the cancellation check; everything else is cut.
        assert!(summary.per_phase.len() <= 1);
    }
}
