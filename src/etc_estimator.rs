//! Per-phase completion-time forecasting.
//!
//! Mirrors the original `DynamicPhaseEstimator`: a bounded ring of recent
//! per-item durations feeds a median, seeded from historical per-phase
//! averages in [`StatsStore`](crate::stats_store::StatsStore) when available.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::stats_store::StatsStore;
use crate::types::ProcessingPhase;

/// Capacity of the rolling per-item-duration ring. Samples beyond this many
/// are forgotten oldest-first; this bounds both memory and the estimator's
/// sensitivity to how "recent" a sample needs to be to matter.
pub const RING_CAPACITY: usize = 50;

/// Samples outside this range are treated as instrumentation noise
/// (e.g. a duration spanning a process suspend) and dropped.
pub const SAMPLE_MIN_SECONDS: f64 = 0.1;
pub const SAMPLE_MAX_SECONDS: f64 = 3600.0;

#[derive(Clone, Debug)]
struct PhaseRuntime {
    total_items: u64,
    processed_items: u64,
    start_time: DateTime<Utc>,
    last_update_time: DateTime<Utc>,
    item_times: VecDeque<f64>,
    current_avg_time_per_item: f64,
    estimated_completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhaseEstimate {
    pub total_items: u64,
    pub processed_items: u64,
    pub current_avg_time_per_item_seconds: f64,
    pub estimated_completion_timestamp: Option<DateTime<Utc>>,
}

/// Tracks in-flight per-phase estimates. Not `Send`-shared directly; owned by
/// the `PipelineEngine` for the duration of a run and driven from its single
/// orchestration task.
#[derive(Default)]
pub struct EtcEstimator {
    active: HashMap<ProcessingPhase, PhaseRuntime>,
}

impl EtcEstimator {
    pub fn new() -> Self {
        EtcEstimator::default()
    }

    /// Begin tracking `phase`. Seeds the forecast from historical stats if
    /// any exist; otherwise the forecast stays `None` until enough live
    /// samples accumulate.
    pub fn init(&mut self, phase: ProcessingPhase, total_items: u64, stats: &StatsStore) {
        let now = Utc::now();
        let historical_avg = stats.get(phase).avg_time_per_item_seconds;

        let estimated_completion_timestamp = if historical_avg > 0.0 {
            Some(now + ChronoDuration::milliseconds((historical_avg * total_items as f64 * 1000.0) as i64))
        } else {
            None
        };

        self.active.insert(
            phase,
            PhaseRuntime {
                total_items,
                processed_items: 0,
                start_time: now,
                last_update_time: now,
                item_times: VecDeque::new(),
                current_avg_time_per_item: historical_avg,
                estimated_completion_timestamp,
            },
        );
    }

    /// Update progress for `phase`. If `item_duration` is given it is pushed
    /// onto the ring directly (filtered by the noise bounds); otherwise a
    /// per-item duration is inferred from elapsed wall-clock time since the
    /// last update, divided across however many items advanced.
    pub fn update(&mut self, phase: ProcessingPhase, processed_items: u64, item_duration: Option<f64>) {
        let Some(runtime) = self.active.get_mut(&phase) else {
            return;
        };

        let now = Utc::now();

        if let Some(duration) = item_duration {
            push_sample(&mut runtime.item_times, duration);
        } else {
            let delta_items = processed_items.saturating_sub(runtime.processed_items);
            if delta_items > 0 {
                let elapsed = (now - runtime.last_update_time).num_milliseconds() as f64 / 1000.0;
                let inferred = elapsed / delta_items as f64;
                push_sample(&mut runtime.item_times, inferred);
            }
        }

        runtime.processed_items = processed_items;
        runtime.last_update_time = now;

        runtime.current_avg_time_per_item = if !runtime.item_times.is_empty() {
            median(&runtime.item_times)
        } else {
            runtime.current_avg_time_per_item
        };

        let remaining = runtime.total_items.saturating_sub(runtime.processed_items);
        runtime.estimated_completion_timestamp = Some(
            now + ChronoDuration::milliseconds(
                (remaining as f64 * runtime.current_avg_time_per_item * 1000.0) as i64,
            ),
        );
    }

    pub fn estimate(&self, phase: ProcessingPhase) -> Option<PhaseEstimate> {
        self.active.get(&phase).map(|r| PhaseEstimate {
            total_items: r.total_items,
            processed_items: r.processed_items,
            current_avg_time_per_item_seconds: r.current_avg_time_per_item,
            estimated_completion_timestamp: r.estimated_completion_timestamp,
        })
    }

    pub fn active_estimates(&self) -> HashMap<ProcessingPhase, PhaseEstimate> {
        self.active
            .iter()
            .map(|(phase, r)| {
                (
                    *phase,
                    PhaseEstimate {
                        total_items: r.total_items,
                        processed_items: r.processed_items,
                        current_avg_time_per_item_seconds: r.current_avg_time_per_item,
                        estimated_completion_timestamp: r.estimated_completion_timestamp,
                    },
                )
            })
            .collect()
    }

    /// Fold the completed phase's totals back into `stats` and drop the
    /// in-memory runtime entry. No-op (w.r.t. stats) if nothing was processed.
    pub async fn finalize(&mut self, phase: ProcessingPhase, stats: &StatsStore) {
        if let Some(runtime) = self.active.remove(&phase) {
            let total_duration = (Utc::now() - runtime.start_time).num_milliseconds() as f64 / 1000.0;
            stats.record(phase, runtime.processed_items, total_duration).await;
        }
    }
}

fn push_sample(ring: &mut VecDeque<f64>, sample: f64) {
    if !(SAMPLE_MIN_SECONDS..=SAMPLE_MAX_SECONDS).contains(&sample) {
        return;
    }
    if ring.len() >= RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(sample);
}

fn median(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_ignores_outliers_unlike_mean() {
        let mut ring = VecDeque::new();
        for _ in 0..9 {
            push_sample(&mut ring, 1.0);
        }
        push_sample(&mut ring, 600.0);

        assert_eq!(median(&ring), 1.0);
        let mean: f64 = ring.iter().sum::<f64>() / ring.len() as f64;
        assert!(mean > 60.0, "sanity check: mean should be dragged up by the outlier");
    }

    #[test]
    fn samples_outside_noise_bounds_are_dropped() {
        let mut ring = VecDeque::new();
        push_sample(&mut ring, 0.05); // below SAMPLE_MIN_SECONDS
        push_sample(&mut ring, 4000.0); // above SAMPLE_MAX_SECONDS
        push_sample(&mut ring, 2.5); // valid
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0], 2.5);
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let mut ring = VecDeque::new();
        for i in 0..(RING_CAPACITY + 10) {
            push_sample(&mut ring, 1.0 + i as f64 * 0.001);
        }
        assert_eq!(ring.len(), RING_CAPACITY);
    }

    #[tokio::test]
    async fn update_with_zero_delta_items_is_ring_noop() {
        let stats = StatsStore::in_memory();
        let mut estimator = EtcEstimator::new();
        estimator.init(ProcessingPhase::Media, 10, &stats);
        estimator.update(ProcessingPhase::Media, 0, None);

        let runtime = estimator.active.get(&ProcessingPhase::Media).unwrap();
        assert!(runtime.item_times.is_empty());
    }

    #[tokio::test]
    async fn finalize_records_into_stats_store() {
        let stats = StatsStore::in_memory();
        let mut estimator = EtcEstimator::new();
        estimator.init(ProcessingPhase::Cache, 5, &stats);
        estimator.update(ProcessingPhase::Cache, 5, Some(2.0));
        estimator.finalize(ProcessingPhase::Cache, &stats).await;

        let loaded = stats.get(ProcessingPhase::Cache);
        assert_eq!(loaded.total_items_processed, 5);
        assert!(estimator.estimate(ProcessingPhase::Cache).is_none());
    }
}
