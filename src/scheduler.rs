//! Evaluates recurring [`ScheduleDefinition`]s on a timer and starts pipeline
//! runs through the [`AgentController`] when they come due.
//!
//! A single task woken by a `tokio::time::interval` tick, racing the tick
//! against `cancel.cancelled()` in a `tokio::select!`, picking up every
//! schedule whose `next_run_at` has passed. Persistence of schedule
//! definitions and run history reuses the same temp-file-then-rename atomic
//! write every other on-disk store in this crate uses, rather than standing
//! up a second store actor for what is, in practice, a small and
//! infrequently-written map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::controller::{AgentController, StartOutcome};
use crate::error::KbaError;
use crate::types::{ScheduleDefinition, ScheduleFrequency, ScheduleRun};

/// Runs retained per schedule before the oldest are dropped.
const RUN_HISTORY_CAPACITY: usize = 20;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct ScheduleFile {
    schedules: HashMap<String, ScheduleDefinition>,
    #[serde(default)]
    history: HashMap<String, Vec<ScheduleRun>>,
}

/// Owns the schedule map and its run history, both persisted to a single
/// JSON file with the same atomic write pattern as `item_store.rs`/
/// `stats_store.rs`.
pub struct Scheduler {
    controller: AgentController,
    path: Option<PathBuf>,
    file: ScheduleFile,
}

impl Scheduler {
    pub fn in_memory(controller: AgentController) -> Self {
        Scheduler { controller, path: None, file: ScheduleFile::default() }
    }

    pub fn load(controller: AgentController, path: PathBuf) -> Result<Self, KbaError> {
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| KbaError::Storage(format!("reading {}: {e}", path.display())))?;
            serde_json::from_str(&contents)
                .map_err(|e| KbaError::Storage(format!("parsing {}: {e}", path.display())))?
        } else {
            ScheduleFile::default()
        };
        Ok(Scheduler { controller, path: Some(path), file })
    }

    fn persist(&self) -> Result<(), KbaError> {
        let Some(path) = &self.path else { return Ok(()) };
        persist_schedule_file(&self.file, path)
    }

    pub fn upsert(&mut self, mut definition: ScheduleDefinition) -> Result<(), KbaError> {
        if definition.next_run_at.is_none() {
            definition.next_run_at = next_run_at(&definition, definition.last_run_at);
        }
        self.file.schedules.insert(definition.name.clone(), definition);
        self.persist()
    }

    pub fn remove(&mut self, name: &str) -> Result<bool, KbaError> {
        let removed = self.file.schedules.remove(name).is_some();
        self.file.history.remove(name);
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<ScheduleDefinition> {
        self.file.schedules.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ScheduleDefinition> {
        let mut schedules: Vec<_> = self.file.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    pub fn history(&self, name: &str) -> Vec<ScheduleRun> {
        self.file.history.get(name).cloned().unwrap_or_default()
    }

    /// Evaluate every enabled schedule once against `now`, starting a run for
    /// each one whose `next_run_at` has passed. A schedule already overdue by
    /// more than one period is not caught up multiple times: `next_run_at` is
    /// simply recomputed from `now`, so a missed period is skipped rather
    /// than replayed.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<Uuid>, KbaError> {
        let due: Vec<String> = self
            .file
            .schedules
            .iter()
            .filter(|(_, s)| s.enabled && s.frequency != ScheduleFrequency::Manual)
            .filter(|(_, s)| s.next_run_at.map(|t| t <= now).unwrap_or(true))
            .map(|(name, _)| name.clone())
            .collect();

        let mut started = Vec::new();
        for name in due {
            if let Some(task_id) = self.fire(&name, now).await? {
                started.push(task_id);
            }
        }
        Ok(started)
    }

    async fn fire(&mut self, name: &str, now: DateTime<Utc>) -> Result<Option<Uuid>, KbaError> {
        let outcome = self.controller.start().await?;
        let (task_id, success, message) = match outcome {
            StartOutcome::Started(task_id) => (task_id, true, None),
            StartOutcome::AlreadyRunning(task_id) => {
                (task_id, false, Some("agent already running; schedule tick skipped".to_string()))
            }
        };

        let run = ScheduleRun {
            schedule_name: name.to_string(),
            task_id,
            started_at: now,
            ended_at: None,
            success,
            message,
        };
        let history = self.file.history.entry(name.to_string()).or_default();
        history.push(run);
        if history.len() > RUN_HISTORY_CAPACITY {
            let drop = history.len() - RUN_HISTORY_CAPACITY;
            history.drain(0..drop);
        }

        if let Some(definition) = self.file.schedules.get_mut(name) {
            definition.last_run_at = Some(now);
            definition.next_run_at = next_run_at(definition, Some(now));
        }
        self.persist()?;

        Ok(if success { Some(task_id) } else { None })
    }

    /// Run the poll loop until `cancel` fires. Intended to be spawned once
    /// per process alongside the `AgentController`.
    pub async fn run(mut self, poll_interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::warn!(error = %e, "schedule tick failed");
                    }
                }
            }
        }
    }
}

/// Compute the next due time for a schedule, given when it last ran (`None`
/// meaning never). `daily`/`weekly`/`monthly` are fixed `chrono::Duration`
/// offsets; `custom_cron` is evaluated with the `cron` crate; `manual` never
/// reschedules itself.
fn next_run_at(definition: &ScheduleDefinition, from: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let anchor = from.unwrap_or_else(Utc::now);
    match definition.frequency {
        ScheduleFrequency::Manual => None,
        ScheduleFrequency::Daily => Some(anchor + ChronoDuration::days(1)),
        ScheduleFrequency::Weekly => Some(anchor + ChronoDuration::weeks(1)),
        ScheduleFrequency::Monthly => Some(anchor + ChronoDuration::days(30)),
        ScheduleFrequency::CustomCron => {
            let expr = definition.cron_expr.as_deref()?;
            let schedule = cron::Schedule::from_str(expr).ok()?;
            schedule.after(&anchor).next()
        }
    }
}

fn persist_schedule_file(file: &ScheduleFile, path: &Path) -> Result<(), KbaError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KbaError::Storage(format!("creating {}: {e}", parent.display())))?;
    }
    let contents = serde_json::to_string_pretty(file).map_err(|e| KbaError::Storage(format!("serializing schedules: {e}")))?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| KbaError::Storage(format!("creating temp file: {e}")))?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes()).map_err(|e| KbaError::Storage(format!("writing temp file: {e}")))?;
    tmp.as_file().sync_all().map_err(|e| KbaError::Storage(format!("syncing temp file: {e}")))?;
    tmp.persist(path).map_err(|e| KbaError::Storage(format!("persisting {}: {e}", path.display())))?;
    Ok(())
}
