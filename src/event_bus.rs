//! Typed, best-effort fan-out of run status/progress/log events to subscribers.
//!
//! `task_runtime.rs`'s `mpsc`/`oneshot` actor plumbing is request/reply, not
//! fan-out; this is one `tokio::sync::broadcast` per logical channel instead,
//! each bounded so a stalled subscriber cannot grow memory without bound. A
//! subscriber that falls behind sees `RecvError::Lagged` on its next poll;
//! callers are expected to use [`recv_lossy`] rather than the raw receiver so
//! that condition is logged and skipped rather than treated as fatal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{ProcessingPhase, RunPhase};

/// Capacity per channel. A subscriber more than this many events behind the
/// producer is declared lagged rather than left to buffer indefinitely.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Periodic full-state snapshot, including a 0-100 overall progress figure
/// when one is known. Distinct from [`AgentStatusUpdateEvent`]: this is the
/// "here is everything" snapshot a newly-connected subscriber would want,
/// not a one-off change notification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentStatusEvent {
    pub is_running: bool,
    pub current_task_id: Option<Uuid>,
    pub current_phase_message: Option<String>,
    pub progress: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// A lighter-weight real-time notification that the agent's running state
/// just changed (started, stopped, finished) — no `progress` field, since
/// that's `agent_progress_update`'s job. Subscribers that only care about
/// "is it running now" can use this channel instead of polling snapshots.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentStatusUpdateEvent {
    pub is_running: bool,
    pub current_task_id: Option<Uuid>,
    pub current_phase_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentProgressEvent {
    pub task_id: Uuid,
    pub current: u64,
    pub total: u64,
    pub phase: Option<String>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Skipped,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PhaseUpdateEvent {
    pub task_id: Uuid,
    pub run_phase: RunPhase,
    pub processing_phase: Option<ProcessingPhase>,
    pub status: PhaseStatus,
    pub progress: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogMessageEvent {
    pub level: LogLevel,
    pub module: String,
    pub message: String,
    pub task_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct GpuStatsEvent {
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemHealthEvent {
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PhaseOutcomeCounts {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct RunResultsSummary {
    pub per_phase: std::collections::HashMap<String, PhaseOutcomeCounts>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentRunCompletedEvent {
    pub task_id: Uuid,
    pub success: bool,
    pub duration_seconds: f64,
    pub results: RunResultsSummary,
    pub timestamp: DateTime<Utc>,
}

/// One `broadcast` sender per logical channel named in the event contract.
/// Cloning an `EventBus` clones the senders (cheap; they're reference-counted
/// internally), giving every subscriber and publisher its own handle onto the
/// same set of channels.
#[derive(Clone)]
pub struct EventBus {
    agent_status: broadcast::Sender<AgentStatusEvent>,
    agent_status_update: broadcast::Sender<AgentStatusUpdateEvent>,
    agent_progress_update: broadcast::Sender<AgentProgressEvent>,
    phase_update: broadcast::Sender<PhaseUpdateEvent>,
    log_message: broadcast::Sender<LogMessageEvent>,
    gpu_stats: broadcast::Sender<GpuStatsEvent>,
    system_health_update: broadcast::Sender<SystemHealthEvent>,
    agent_run_completed: broadcast::Sender<AgentRunCompletedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            agent_status: broadcast::channel(CHANNEL_CAPACITY).0,
            agent_status_update: broadcast::channel(CHANNEL_CAPACITY).0,
            agent_progress_update: broadcast::channel(CHANNEL_CAPACITY).0,
            phase_update: broadcast::channel(CHANNEL_CAPACITY).0,
            log_message: broadcast::channel(CHANNEL_CAPACITY).0,
            gpu_stats: broadcast::channel(CHANNEL_CAPACITY).0,
            system_health_update: broadcast::channel(CHANNEL_CAPACITY).0,
            agent_run_completed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn publish_agent_status(&self, event: AgentStatusEvent) {
        let _ = self.agent_status.send(event);
    }

    pub fn publish_agent_status_update(&self, event: AgentStatusUpdateEvent) {
        let _ = self.agent_status_update.send(event);
    }

    pub fn publish_agent_progress(&self, event: AgentProgressEvent) {
        let _ = self.agent_progress_update.send(event);
    }

    pub fn publish_phase_update(&self, event: PhaseUpdateEvent) {
        let _ = self.phase_update.send(event);
    }

    pub fn publish_log_message(&self, event: LogMessageEvent) {
        let _ = self.log_message.send(event);
    }

    pub fn publish_gpu_stats(&self, event: GpuStatsEvent) {
        let _ = self.gpu_stats.send(event);
    }

    pub fn publish_system_health(&self, event: SystemHealthEvent) {
        let _ = self.system_health_update.send(event);
    }

    pub fn publish_run_completed(&self, event: AgentRunCompletedEvent) {
        let _ = self.agent_run_completed.send(event);
    }

    pub fn subscribe_agent_status(&self) -> broadcast::Receiver<AgentStatusEvent> {
        self.agent_status.subscribe()
    }

    pub fn subscribe_agent_status_update(&self) -> broadcast::Receiver<AgentStatusUpdateEvent> {
        self.agent_status_update.subscribe()
    }

    pub fn subscribe_agent_progress(&self) -> broadcast::Receiver<AgentProgressEvent> {
        self.agent_progress_update.subscribe()
    }

    pub fn subscribe_phase_update(&self) -> broadcast::Receiver<PhaseUpdateEvent> {
        self.phase_update.subscribe()
    }

    pub fn subscribe_log_message(&self) -> broadcast::Receiver<LogMessageEvent> {
        self.log_message.subscribe()
    }

    pub fn subscribe_gpu_stats(&self) -> broadcast::Receiver<GpuStatsEvent> {
        self.gpu_stats.subscribe()
    }

    pub fn subscribe_system_health(&self) -> broadcast::Receiver<SystemHealthEvent> {
        self.system_health_update.subscribe()
    }

    pub fn subscribe_run_completed(&self) -> broadcast::Receiver<AgentRunCompletedEvent> {
        self.agent_run_completed.subscribe()
    }
}

/// Await the next event on `rx`, logging and skipping past any lag rather
/// than surfacing `RecvError::Lagged` to the caller. Returns `None` once the
/// channel is permanently closed (every `EventBus` handle dropped).
pub async fn recv_lossy<T: Clone + Send + 'static>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event bus subscriber lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_agent_status();

        bus.publish_agent_status(AgentStatusEvent {
            is_running: true,
            current_task_id: None,
            current_phase_message: Some("starting".to_string()),
            progress: Some(0),
            timestamp: Utc::now(),
        });

        let event = recv_lossy(&mut rx).await.unwrap();
        assert!(event.is_running);
    }

    #[tokio::test]
    async fn agent_status_and_agent_status_update_are_independent_channels() {
        let bus = EventBus::new();
        let mut status_rx = bus.subscribe_agent_status();
        let mut status_update_rx = bus.subscribe_agent_status_update();

        bus.publish_agent_status_update(AgentStatusUpdateEvent {
            is_running: false,
            current_task_id: None,
            current_phase_message: Some("Agent stopped by user".to_string()),
            timestamp: Utc::now(),
        });

        let update = recv_lossy(&mut status_update_rx).await.unwrap();
        assert!(!update.is_running);

        // The snapshot channel never saw that publish; it's a separate channel.
        assert!(status_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish_phase_update(PhaseUpdateEvent {
            task_id: Uuid::new_v4(),
            run_phase: RunPhase::ContentProcessing,
            processing_phase: Some(ProcessingPhase::Media),
            status: PhaseStatus::Started,
            progress: None,
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_past_lag_instead_of_erroring() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_log_message();

        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish_log_message(LogMessageEvent {
                level: LogLevel::Info,
                module: "test".to_string(),
                message: format!("msg {i}"),
                task_id: None,
                timestamp: Utc::now(),
            });
        }

        // The receiver is far behind; recv_lossy must still return a value
        // (the oldest still-buffered one) rather than an error.
        let event = recv_lossy(&mut rx).await;
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn closed_bus_returns_none() {
        let (tx, mut rx) = broadcast::channel::<AgentStatusEvent>(4);
        drop(tx);
        assert!(recv_lossy(&mut rx).await.is_none());
    }
}
