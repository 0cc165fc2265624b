//! Asynchronous job execution: submission, cancellation, progress, retry,
//! and heartbeat-based dead-worker detection.
//!
//! A `JoinSet` of spawned jobs, drained on cancellation and fed from a pure
//! action-selection function, holds an arbitrary boxed job per queue; an
//! mpsc-actor owns the `TaskState` table itself so state reads and mutations
//! never race the join loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::KbaError;
use crate::retry_manager::classify_error;
use crate::types::{FailureType, TaskProgress, TaskState, TaskStatus, TaskType};

/// Jobs are retried this many times before the task transitions to FAILURE.
/// Independent of the per-item `RetryConfig` used by the pipeline engine,
/// which tracks retries on `ItemRecord` rather than on a bare job.
const MAX_JOB_RETRIES: u32 = 3;

/// The workload classes a job queue serves. Kept separate so a burst in one
/// class (e.g. AI calls) cannot starve another (e.g. monitoring).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobQueue {
    ContentFetching,
    AiProcessing,
    Synthesis,
    Monitoring,
    Default,
    Priority,
}

impl JobQueue {
    pub const ALL: [JobQueue; 6] = [
        JobQueue::ContentFetching,
        JobQueue::AiProcessing,
        JobQueue::Synthesis,
        JobQueue::Monitoring,
        JobQueue::Default,
        JobQueue::Priority,
    ];

    /// Default per-minute cap per queue, matching the documented figures.
    fn default_per_minute(&self) -> u32 {
        match self {
            JobQueue::ContentFetching => 30,
            JobQueue::AiProcessing => 10,
            JobQueue::Synthesis => 5,
            JobQueue::Monitoring => u32::MAX,
            JobQueue::Default => u32::MAX,
            JobQueue::Priority => u32::MAX,
        }
    }
}

/// Coalescing window for progress writes: at most one update per task per
/// this interval is persisted to `TaskState`.
const PROGRESS_COALESCE: Duration = Duration::from_millis(100);

/// A worker that stops heartbeating for this many multiples of its interval
/// is declared dead.
const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
const HEARTBEAT_MISS_FACTOR: u32 = 3;

/// Default `TaskState` history retention, applied on every monitor tick in
/// addition to being available as an explicit `cleanup` operation.
const DEFAULT_HISTORY_RETENTION_DAYS: i64 = 7;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), KbaError>> + Send>>;
/// A job is a factory rather than a one-shot closure so that a recoverable
/// failure can re-enqueue the *same* `task_id` for another attempt.
pub type JobRunner = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// Handed to a running job: its cancellation token and a way to report
/// progress back to its `TaskState` without knowing about the runtime's
/// internals.
#[derive(Clone)]
pub struct JobContext {
    pub cancel: CancellationToken,
    task_id: Uuid,
    progress_tx: mpsc::Sender<TaskRuntimeCommand>,
}

impl JobContext {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn report_progress(&self, current: u64, total: u64) {
        let _ = self
            .progress_tx
            .send(TaskRuntimeCommand::ReportProgress {
                task_id: self.task_id,
                current,
                total,
            })
            .await;
    }

    pub async fn heartbeat(&self) {
        let _ = self
            .progress_tx
            .send(TaskRuntimeCommand::Heartbeat { task_id: self.task_id })
            .await;
    }
}

#[derive(Clone)]
pub struct JobSpec {
    pub queue: JobQueue,
    pub task_type: TaskType,
    pub phase: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub run: JobRunner,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = if per_minute == u32::MAX { f64::MAX } else { per_minute as f64 };
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_second: if per_minute == u32::MAX { f64::MAX } else { per_minute as f64 / 60.0 },
            last_refill: Utc::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Utc::now();
        let elapsed = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
struct PendingJob {
    spec: JobSpec,
    task_id: Uuid,
}

enum TaskRuntimeCommand {
    Submit {
        spec: JobSpec,
        reply: oneshot::Sender<Uuid>,
    },
    Cancel {
        task_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Status {
        task_id: Uuid,
        reply: oneshot::Sender<Option<TaskState>>,
    },
    ListActive {
        reply: oneshot::Sender<Vec<TaskState>>,
    },
    ListHistory {
        reply: oneshot::Sender<Vec<TaskState>>,
    },
    Statistics {
        reply: oneshot::Sender<RuntimeStatistics>,
    },
    Cleanup {
        older_than_days: i64,
        reply: oneshot::Sender<u64>,
    },
    ReportProgress {
        task_id: Uuid,
        current: u64,
        total: u64,
    },
    Heartbeat {
        task_id: Uuid,
    },
    JobFinished {
        task_id: Uuid,
        result: Result<(), KbaError>,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeStatistics {
    pub active_count: usize,
    pub pending_count: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
}

#[derive(Clone)]
pub struct TaskRuntimeHandle {
    sender: mpsc::Sender<TaskRuntimeCommand>,
}

impl TaskRuntimeHandle {
    pub async fn submit(&self, spec: JobSpec) -> Uuid {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::Submit { spec, reply }).await;
        rx.await.expect("task runtime dropped reply")
    }

    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::Cancel { task_id, reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn status(&self, task_id: Uuid) -> Option<TaskState> {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::Status { task_id, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn list_active(&self) -> Vec<TaskState> {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::ListActive { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn list_history(&self) -> Vec<TaskState> {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::ListHistory { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn statistics(&self) -> RuntimeStatistics {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::Statistics { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn cleanup(&self, older_than_days: i64) -> u64 {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(TaskRuntimeCommand::Cleanup { older_than_days, reply }).await;
        rx.await.unwrap_or(0)
    }
}

struct RunningEntry {
    cancel: CancellationToken,
    last_heartbeat: DateTime<Utc>,
    queue: JobQueue,
}

struct RuntimeState {
    active: HashMap<Uuid, TaskState>,
    history: Vec<TaskState>,
    running: HashMap<Uuid, RunningEntry>,
    running_specs: HashMap<Uuid, PendingJob>,
    queued: HashMap<JobQueue, Vec<PendingJob>>,
    buckets: HashMap<JobQueue, TokenBucket>,
    last_progress_write: HashMap<Uuid, DateTime<Utc>>,
    job_retry_counts: HashMap<Uuid, u32>,
    completed_count: u64,
    failed_count: u64,
    cancelled_count: u64,
}

fn handle_submit(state: &mut RuntimeState, spec: JobSpec) -> Uuid {
    let mut task_state = TaskState::new(spec.task_type, spec.phase.clone());
    task_state.parent_task_id = spec.parent_task_id;
    let task_id = task_state.task_id;
    state.active.insert(task_id, task_state);
    state.queued.entry(spec.queue).or_default().push(PendingJob { spec, task_id });
    task_id
}

fn handle_cancel(state: &mut RuntimeState, task_id: Uuid) -> bool {
    if let Some(entry) = state.running.get(&task_id) {
        entry.cancel.cancel();
        return true;
    }
    // Not yet running: drop from every queue and mark cancelled directly.
    let mut found = false;
    for jobs in state.queued.values_mut() {
        let before = jobs.len();
        jobs.retain(|j| j.task_id != task_id);
        if jobs.len() != before {
            found = true;
        }
    }
    if found {
        if let Some(mut task) = state.active.remove(&task_id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            state.cancelled_count += 1;
            state.history.push(task);
        }
    }
    found
}

fn handle_report_progress(state: &mut RuntimeState, task_id: Uuid, current: u64, total: u64) {
    let now = Utc::now();
    let should_write = match state.last_progress_write.get(&task_id) {
        Some(last) => (now - *last).num_milliseconds() as u64 >= PROGRESS_COALESCE.as_millis() as u64,
        None => true,
    };
    if !should_write {
        return;
    }
    state.last_progress_write.insert(task_id, now);
    if let Some(task) = state.active.get_mut(&task_id) {
        task.progress = Some(TaskProgress { current, total });
    }
}

fn handle_heartbeat(state: &mut RuntimeState, task_id: Uuid) {
    if let Some(entry) = state.running.get_mut(&task_id) {
        entry.last_heartbeat = Utc::now();
    }
}

/// Finalizes the finished job's `TaskState` and, on a recoverable failure
/// within budget, returns the same job re-wrapped for re-enqueue under its
/// original `task_id` (the re-enqueue/retry contract of the job runtime).
fn handle_job_finished(state: &mut RuntimeState, task_id: Uuid, result: Result<(), KbaError>) -> Option<PendingJob> {
    state.running.remove(&task_id);
    state.last_progress_write.remove(&task_id);
    let spec = state.running_specs.remove(&task_id);

    let Some(mut task) = state.active.remove(&task_id) else {
        return None;
    };

    match result {
        Ok(()) => {
            task.status = TaskStatus::Success;
            task.completed_at = Some(Utc::now());
            state.completed_count += 1;
            state.job_retry_counts.remove(&task_id);
            state.history.push(task);
            None
        }
        Err(KbaError::Cancelled) => {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            state.cancelled_count += 1;
            state.job_retry_counts.remove(&task_id);
            state.history.push(task);
            None
        }
        Err(err) => {
            let failure = classify_error(&err);
            let attempts = state.job_retry_counts.entry(task_id).or_insert(0);
            *attempts += 1;

            let retryable = failure != FailureType::PermanentError && *attempts <= MAX_JOB_RETRIES;

            match (retryable, spec) {
                (true, Some(pending)) => {
                    tracing::warn!(%task_id, attempt = *attempts, ?failure, "job failed, retrying");
                    task.status = TaskStatus::Retrying;
                    task.error = Some(err.to_string());
                    state.active.insert(task_id, task);
                    Some(pending)
                }
                _ => {
                    tracing::error!(%task_id, attempt = *attempts, ?failure, error = %err, "job failed permanently");
                    task.status = TaskStatus::Failure;
                    task.error = Some(err.to_string());
                    task.completed_at = Some(Utc::now());
                    state.failed_count += 1;
                    state.job_retry_counts.remove(&task_id);
                    state.history.push(task);
                    None
                }
            }
        }
    }
}

fn handle_cleanup(state: &mut RuntimeState, older_than_days: i64) -> u64 {
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    let before = state.history.len();
    state.history.retain(|t| t.completed_at.map(|c| c > cutoff).unwrap_or(true));
    (before - state.history.len()) as u64
}

fn dispatch_ready_jobs(state: &mut RuntimeState, join_set: &mut JoinSet<(Uuid, Result<(), KbaError>)>, progress_tx: &mpsc::Sender<TaskRuntimeCommand>) {
    for queue in JobQueue::ALL {
        let bucket = state.buckets.entry(queue).or_insert_with(|| TokenBucket::new(queue.default_per_minute()));
        let Some(jobs) = state.queued.get_mut(&queue) else { continue };

        while !jobs.is_empty() {
            if !bucket.try_take() {
                break;
            }
            let job = jobs.remove(0);
            let cancel = CancellationToken::new();
            let task_id = job.task_id;

            state.running.insert(
                task_id,
                RunningEntry {
                    cancel: cancel.clone(),
                    last_heartbeat: Utc::now(),
                    queue,
                },
            );
            state.running_specs.insert(task_id, job.clone());
            if let Some(task) = state.active.get_mut(&task_id) {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
            }

            let ctx = JobContext {
                cancel: cancel.clone(),
                task_id,
                progress_tx: progress_tx.clone(),
            };
            let run = job.spec.run;
            join_set.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(KbaError::Cancelled),
                    r = run(ctx) => r,
                };
                (task_id, result)
            });
        }
    }
}

fn detect_dead_workers(state: &mut RuntimeState) -> Vec<Uuid> {
    let threshold = Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS * HEARTBEAT_MISS_FACTOR as u64);
    let now = Utc::now();
    state
        .running
        .iter()
        .filter(|(_, entry)| (now - entry.last_heartbeat).num_seconds() as u64 >= threshold.as_secs())
        .map(|(id, _)| *id)
        .collect()
}

async fn run_task_runtime(mut rx: mpsc::Receiver<TaskRuntimeCommand>, self_tx: mpsc::Sender<TaskRuntimeCommand>) {
    let mut state = RuntimeState {
        active: HashMap::new(),
        history: Vec::new(),
        running: HashMap::new(),
        queued: HashMap::new(),
        buckets: HashMap::new(),
        last_progress_write: HashMap::new(),
        job_retry_counts: HashMap::new(),
        completed_count: 0,
        failed_count: 0,
        cancelled_count: 0,
    };
    let mut join_set: JoinSet<(Uuid, Result<(), KbaError>)> = JoinSet::new();
    let mut monitor = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS));

    loop {
        tokio::select! {
            maybe_cmd = rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                match cmd {
                    TaskRuntimeCommand::Submit { spec, reply } => {
                        let task_id = handle_submit(&mut state, spec);
                        dispatch_ready_jobs(&mut state, &mut join_set, &self_tx);
                        let _ = reply.send(task_id);
                    }
                    TaskRuntimeCommand::Cancel { task_id, reply } => {
                        let _ = reply.send(handle_cancel(&mut state, task_id));
                    }
                    TaskRuntimeCommand::Status { task_id, reply } => {
                        let found = state.active.get(&task_id).cloned().or_else(|| {
                            state.history.iter().find(|t| t.task_id == task_id).cloned()
                        });
                        let _ = reply.send(found);
                    }
                    TaskRuntimeCommand::ListActive { reply } => {
                        let _ = reply.send(state.active.values().cloned().collect());
                    }
                    TaskRuntimeCommand::ListHistory { reply } => {
                        let _ = reply.send(state.history.clone());
                    }
                    TaskRuntimeCommand::Statistics { reply } => {
                        let stats = RuntimeStatistics {
                            active_count: state.running.len(),
                            pending_count: state.queued.values().map(|v| v.len()).sum(),
                            completed_count: state.completed_count,
                            failed_count: state.failed_count,
                            cancelled_count: state.cancelled_count,
                        };
                        let _ = reply.send(stats);
                    }
                    TaskRuntimeCommand::Cleanup { older_than_days, reply } => {
                        let _ = reply.send(handle_cleanup(&mut state, older_than_days));
                    }
                    TaskRuntimeCommand::ReportProgress { task_id, current, total } => {
                        handle_report_progress(&mut state, task_id, current, total);
                    }
                    TaskRuntimeCommand::Heartbeat { task_id } => {
                        handle_heartbeat(&mut state, task_id);
                    }
                    TaskRuntimeCommand::JobFinished { task_id, result } => {
                        if let Some(retry) = handle_job_finished(&mut state, task_id, result) {
                            state.queued.entry(retry.spec.queue).or_default().push(retry);
                        }
                        dispatch_ready_jobs(&mut state, &mut join_set, &self_tx);
                    }
                }
            }
            Some(joined) = join_set.join_next() => {
                if let Ok((task_id, result)) = joined {
                    let _ = self_tx.send(TaskRuntimeCommand::JobFinished { task_id, result }).await;
                }
            }
            _ = monitor.tick() => {
                for task_id in detect_dead_workers(&mut state) {
                    tracing::warn!(%task_id, missed = HEARTBEAT_MISS_FACTOR, "worker declared dead, missed heartbeats");
                    let _ = self_tx.send(TaskRuntimeCommand::JobFinished {
                        task_id,
                        result: Err(KbaError::WorkerLost { missed_heartbeats: HEARTBEAT_MISS_FACTOR }),
                    }).await;
                }
                handle_cleanup(&mut state, DEFAULT_HISTORY_RETENTION_DAYS);
            }
        }
    }
}

pub fn spawn_task_runtime() -> (TaskRuntimeHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(128);
    let self_tx = tx.clone();
    let task_handle = tokio::spawn(run_task_runtime(rx, self_tx));
    (TaskRuntimeHandle { sender: tx }, task_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn immediate_job(queue: JobQueue, outcome: Result<(), KbaError>) -> JobSpec {
        JobSpec {
            queue,
            task_type: TaskType::ItemBatch,
            phase: None,
            parent_task_id: None,
            run: Arc::new(move |_ctx| {
                let outcome = outcome.clone();
                Box::pin(async move { outcome })
            }),
        }
    }

    #[tokio::test]
    async fn submitted_job_completes_successfully() {
        let (handle, _task) = spawn_task_runtime();
        let task_id = handle.submit(immediate_job(JobQueue::Default, Ok(()))).await;

        for _ in 0..20 {
            if let Some(status) = handle.status(task_id).await {
                if status.status.is_terminal() {
                    assert_eq!(status.status, TaskStatus::Success);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn cancel_before_dispatch_marks_cancelled_immediately() {
        let (handle, _task) = spawn_task_runtime();
        // Exhaust the ai_processing bucket with a slow job so the second job stays queued.
        let started = Arc::new(AtomicBool::new(false));
        let started_clone = started.clone();
        let blocker = JobSpec {
            queue: JobQueue::AiProcessing,
            task_type: TaskType::PhaseExecution,
            phase: None,
            parent_task_id: None,
            run: Arc::new(move |_ctx| {
                let started_clone = started_clone.clone();
                Box::pin(async move {
                    started_clone.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
            }),
        };
        handle.submit(blocker).await;

        // Burn through the rest of the bucket capacity (9 more tokens by default).
        for _ in 0..9 {
            handle.submit(immediate_job(JobQueue::AiProcessing, Ok(()))).await;
        }

        let queued_task = handle.submit(immediate_job(JobQueue::AiProcessing, Ok(()))).await;
        let cancelled = handle.cancel(queued_task).await;
        assert!(cancelled);

        let status = handle.status(queued_task).await.unwrap();
        assert_eq!(status.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn statistics_reflect_completed_jobs() {
        let (handle, _task) = spawn_task_runtime();
        let task_id = handle.submit(immediate_job(JobQueue::Monitoring, Ok(()))).await;

        for _ in 0..20 {
            if handle.status(task_id).await.map(|s| s.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stats = handle.statistics().await;
        assert_eq!(stats.completed_count, 1);
    }

    #[tokio::test]
    async fn cleanup_purges_only_old_terminal_tasks() {
        let (handle, _task) = spawn_task_runtime();
        let task_id = handle.submit(immediate_job(JobQueue::Default, Ok(()))).await;
        for _ in 0..20 {
            if handle.status(task_id).await.map(|s| s.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let purged = handle.cleanup(-1).await;
        assert_eq!(purged, 0, "cleanup(-1 days) should not purge a task completed after 'now minus -1 days'");

        let purged = handle.cleanup(0).await;
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn recoverable_failure_is_retried_until_it_succeeds() {
        let (handle, _task) = spawn_task_runtime();
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let spec = JobSpec {
            queue: JobQueue::Default,
            task_type: TaskType::ItemBatch,
            phase: None,
            parent_task_id: None,
            run: Arc::new(move |_ctx| {
                let attempts = attempts_clone.clone();
                Box::pin(async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(KbaError::Network("connection reset".to_string()))
                    } else {
                        Ok(())
                    }
                })
            }),
        };
        let task_id = handle.submit(spec).await;

        for _ in 0..50 {
            if handle.status(task_id).await.map(|s| s.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let status = handle.status(task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Success);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
