//! Top-level lifecycle facade: `start`/`stop`/`status`/`progress`.
//!
//! A `CancellationToken` drives cooperative shutdown of the running pipeline
//! task rather than a process-group kill, since every long-running operation
//! in this crate is already an async task and not a spawned child process.
//! The one-run-at-a-time invariant is enforced with a `tokio::sync::Mutex`-
//! guarded `Option<RunHandle>` rather than a filesystem lock, since all
//! callers already live in the same process; a filesystem lock is still used
//! at the CLI boundary (see `lock.rs`) to guard against a second *process*
//! invocation.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::KbaError;
use crate::event_bus::{AgentRunCompletedEvent, AgentStatusEvent, AgentStatusUpdateEvent, EventBus};
use crate::pipeline_engine::{PipelineDeps, PipelineEngine};
use crate::types::AgentState;

/// The run currently in flight, if any. Held only long enough to answer
/// `status()`/`stop()`; the actual work runs on the spawned task.
struct RunHandle {
    task_id: Uuid,
    cancel: CancellationToken,
    started_at: Instant,
    join: tokio::task::JoinHandle<()>,
}

/// Outcome of a `start()` call when a run is already active and
/// `start_fails_fast_when_running` is set.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Uuid),
    AlreadyRunning(Uuid),
}

/// Owns the single mutable "is a run in progress" slot and wires a fresh
/// [`PipelineEngine`] onto it per `start()` call. Cloning an `AgentController`
/// shares the same slot (the `Mutex`/`Arc` inside are reference-counted), so
/// the CLI, a future RPC surface, and the [`Scheduler`](crate::scheduler) can
/// all hold their own handle onto one controller.
#[derive(Clone)]
pub struct AgentController {
    deps_template: PipelineDeps,
    event_bus: EventBus,
    fail_fast_when_running: bool,
    current: Arc<Mutex<Option<RunHandle>>>,
}

impl AgentController {
    pub fn new(deps_template: PipelineDeps, fail_fast_when_running: bool) -> Self {
        let event_bus = deps_template.event_bus.clone();
        AgentController {
            deps_template,
            event_bus,
            fail_fast_when_running,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a pipeline run. If one is already running, either fails fast
    /// (returning the in-flight task id) or is a no-op by construction: there
    /// is nowhere to enqueue a second run without a task queue of its own, so
    /// "enqueue" mode here means the caller retries `start()` on its own
    /// schedule (the [`Scheduler`](crate::scheduler) does exactly this).
    pub async fn start(&self) -> Result<StartOutcome, KbaError> {
        let mut guard = self.current.lock().await;

        if let Some(existing) = guard.as_ref() {
            if self.fail_fast_when_running || !existing.join.is_finished() {
                return Ok(StartOutcome::AlreadyRunning(existing.task_id));
            }
        }

        // Drop a finished handle before starting a fresh one.
        if let Some(existing) = guard.take() {
            if !existing.join.is_finished() {
                *guard = Some(existing);
                return Ok(StartOutcome::AlreadyRunning(guard.as_ref().unwrap().task_id));
            }
        }

        let task_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let deps = self.deps_template.clone();
        let bus = self.event_bus.clone();
        let run_cancel = cancel.clone();

        self.event_bus.publish_agent_status(AgentStatusEvent {
            is_running: true,
            current_task_id: Some(task_id),
            current_phase_message: Some("starting".to_string()),
            progress: Some(0),
            timestamp: Utc::now(),
        });
        self.event_bus.publish_agent_status_update(AgentStatusUpdateEvent {
            is_running: true,
            current_task_id: Some(task_id),
            current_phase_message: Some("starting".to_string()),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let join = tokio::spawn(async move {
            let mut engine = PipelineEngine::new(deps);
            let run_started = Utc::now();
            let results = engine.run(task_id, run_cancel).await;
            let duration_seconds = (Utc::now() - run_started).num_milliseconds() as f64 / 1000.0;
            let success = results.per_phase.values().all(|c| c.failed == 0);

            bus.publish_run_completed(AgentRunCompletedEvent {
                task_id,
                success,
                duration_seconds,
                results,
                timestamp: Utc::now(),
            });
            bus.publish_agent_status(AgentStatusEvent {
                is_running: false,
                current_task_id: Some(task_id),
                current_phase_message: Some("idle".to_string()),
                progress: Some(100),
                timestamp: Utc::now(),
            });
            bus.publish_agent_status_update(AgentStatusUpdateEvent {
                is_running: false,
                current_task_id: Some(task_id),
                current_phase_message: Some("idle".to_string()),
                timestamp: Utc::now(),
            });
        });

        *guard = Some(RunHandle { task_id, cancel, started_at: started, join });
        Ok(StartOutcome::Started(task_id))
    }

    /// Request cooperative cancellation of a run. Returns `false` if no run
    /// is active, or if `task_id` is given and doesn't match the active run.
    /// Cancellation is advisory: phases poll `CancellationToken::is_cancelled`
    /// between `RunPhase`s (see `pipeline_engine::run`), so a run stops at the
    /// next phase boundary rather than mid-phase.
    pub async fn stop(&self, task_id: Option<Uuid>) -> bool {
        let guard = self.current.lock().await;
        match guard.as_ref() {
            Some(handle) if task_id.is_none() || task_id == Some(handle.task_id) => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self) -> AgentState {
        let guard = self.current.lock().await;
        match guard.as_ref() {
            Some(handle) => AgentState {
                is_running: !handle.join.is_finished(),
                current_phase_message: None,
                current_task_id: Some(handle.task_id),
                started_at: Some(Utc::now() - chrono::Duration::milliseconds(handle.started_at.elapsed().as_millis() as i64)),
                stop_requested: handle.cancel.is_cancelled(),
            },
            None => AgentState {
                is_running: false,
                current_phase_message: None,
                current_task_id: None,
                started_at: None,
                stop_requested: false,
            },
        }
    }

    /// Block until the currently active run (if any) finishes, or until
    /// `timeout` elapses. Used by the CLI's `run --wait` and by tests; the
    /// scheduler does not call this, since it polls `status()` instead so a
    /// hung run cannot wedge the schedule-evaluation loop.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let maybe_task_id = {
            let guard = self.current.lock().await;
            guard.as_ref().map(|h| h.task_id)
        };
        let Some(task_id) = maybe_task_id else { return true };

        let deadline = Instant::now() + timeout;
        loop {
            {
                let guard = self.current.lock().await;
                match guard.as_ref() {
                    Some(h) if h.task_id == task_id => {
                        if h.join.is_finished() {
                            return true;
                        }
                    }
                    _ => return true,
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::item_store::spawn_item_store_in_memory;
    use crate::model_router::{MockModelBackend, ModelRouter};
    use crate::pipeline_engine::{NoOpContentFetcher, NoOpGitSyncer, NoOpReadmeGenerator};
    use crate::retry_manager::RetryManager;
    use crate::stats_store::StatsStore;
    use crate::task_runtime::spawn_task_runtime;

    async fn test_deps() -> PipelineDeps {
        let (item_store, _item_store_jh) = spawn_item_store_in_memory();
        let (task_runtime, _task_runtime_jh) = spawn_task_runtime();
        PipelineDeps {
            item_store,
            stats: Arc::new(StatsStore::in_memory()),
            task_runtime,
            retry_manager: RetryManager::new(crate::retry_manager::RetryConfig::default()),
            model_router: Arc::new(ModelRouter::default()),
            backend: Arc::new(MockModelBackend::new(Vec::new())),
            event_bus: EventBus::new(),
            content_fetcher: Arc::new(NoOpContentFetcher),
            readme_generator: Arc::new(NoOpReadmeGenerator),
            git_syncer: Arc::new(NoOpGitSyncer),
            runtime_config: RuntimeConfig::default(),
            kb_root: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn start_reports_a_task_id_and_becomes_idle() {
        let controller = AgentController::new(test_deps().await, true);
        let outcome = controller.start().await.unwrap();
        let StartOutcome::Started(task_id) = outcome else {
            panic!("expected Started");
        };

        assert!(controller.wait(Duration::from_secs(5)).await);
        let status = controller.status().await;
        assert!(!status.is_running);
        assert_eq!(status.current_task_id, Some(task_id));
    }

    #[tokio::test]
    async fn second_start_fails_fast_while_one_is_running() {
        let controller = AgentController::new(test_deps().await, true);
        let first = controller.start().await.unwrap();
        let StartOutcome::Started(first_id) = first else {
            panic!("expected Started");
        };

        let second = controller.start().await.unwrap();
        assert_eq!(second, StartOutcome::AlreadyRunning(first_id));

        controller.wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn stop_with_no_active_run_returns_false() {
        let controller = AgentController::new(test_deps().await, true);
        assert!(!controller.stop(None).await);
    }

    #[tokio::test]
    async fn start_after_previous_run_finished_gets_a_new_task_id() {
        let controller = AgentController::new(test_deps().await, true);
        let first = controller.start().await.unwrap();
        let StartOutcome::Started(first_id) = first else {
            panic!("expected Started");
        };
        controller.wait(Duration::from_secs(5)).await;

        let second = controller.start().await.unwrap();
        let StartOutcome::Started(second_id) = second else {
            panic!("expected Started");
        };
        assert_ne!(first_id, second_id);
        controller.wait(Duration::from_secs(5)).await;
    }
}
