//! Partitions items into {needs-work, already-complete, ineligible} per phase.
//!
//! Grounded directly on the original `PhaseExecutionHelper`: the per-phase
//! eligibility chain (cache unconditional, media requires cache, llm requires
//! cache+media, kb_item requires llm plus category/name fields, db_sync
//! requires kb_item plus a path) and the "needs processing" predicates are
//! taken from `_is_tweet_eligible_for_phase` / `_does_tweet_need_processing`.

use std::collections::HashMap;

use crate::types::{ItemRecord, ProcessingPhase};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ForceFlags {
    pub force_recache_items: bool,
    pub force_reprocess_media: bool,
    pub force_reprocess_llm: bool,
    pub force_reprocess_kb_item: bool,
    pub force_regenerate_synthesis: bool,
    pub force_regenerate_embeddings: bool,
}

/// A single pseudo-entry id used for the two global phases, which have no
/// per-item identity of their own.
pub const GLOBAL_PHASE_ENTRY: &str = "__global__";

/// Drives the global-phase (synthesis/embedding) trigger heuristic: run again
/// when the caller has seen at least `min_new_items_for_synthesis` items
/// complete since the last synthesis/embedding run, or force it unconditionally.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalTrigger {
    pub new_items_since_last_run: usize,
    pub min_new_items_for_synthesis: usize,
}

impl Default for GlobalTrigger {
    fn default() -> Self {
        GlobalTrigger {
            new_items_since_last_run: 0,
            min_new_items_for_synthesis: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhasePlan {
    pub phase: Option<ProcessingPhase>,
    pub needs_processing: Vec<String>,
    pub already_complete: Vec<String>,
    pub ineligible: Vec<String>,
}

impl PhasePlan {
    pub fn total_eligible(&self) -> usize {
        self.needs_processing.len() + self.already_complete.len()
    }

    pub fn should_skip_phase(&self) -> bool {
        self.needs_processing.is_empty()
    }
}

pub struct PhasePlanner;

impl PhasePlanner {
    /// The phases a given phase depends on having already run, in order.
    pub fn prerequisites(phase: ProcessingPhase) -> &'static [ProcessingPhase] {
        match phase {
            ProcessingPhase::Cache => &[],
            ProcessingPhase::Media => &[ProcessingPhase::Cache],
            ProcessingPhase::Llm => &[ProcessingPhase::Cache, ProcessingPhase::Media],
            ProcessingPhase::KbItem => &[ProcessingPhase::Cache, ProcessingPhase::Media, ProcessingPhase::Llm],
            ProcessingPhase::DbSync => &[
                ProcessingPhase::Cache,
                ProcessingPhase::Media,
                ProcessingPhase::Llm,
                ProcessingPhase::KbItem,
            ],
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => &[],
        }
    }

    /// Which fields are missing for `record` to be eligible for `phase`,
    /// for debugging "why is this item ineligible" questions.
    pub fn validate_prerequisites(phase: ProcessingPhase, record: &ItemRecord) -> Vec<String> {
        let mut missing = Vec::new();
        match phase {
            ProcessingPhase::Cache => {}
            ProcessingPhase::Media => {
                if !record.cache.complete || record.cache.error.is_some() {
                    missing.push("cache_complete".to_string());
                }
            }
            ProcessingPhase::Llm => {
                if !record.cache.complete || record.cache.error.is_some() {
                    missing.push("cache_complete".to_string());
                }
                if record.media.error.is_some() {
                    missing.push("media_processed".to_string());
                }
            }
            ProcessingPhase::KbItem => {
                missing.extend(Self::validate_prerequisites(ProcessingPhase::Llm, record));
                if !record.llm.complete || record.llm.error.is_some() {
                    missing.push("categories_processed".to_string());
                }
                if record.main_category.is_none() {
                    missing.push("main_category".to_string());
                }
                if record.item_name_suggestion.is_none() {
                    missing.push("item_name_suggestion".to_string());
                }
            }
            ProcessingPhase::DbSync => {
                if !record.kb_item.complete || record.kb_item.error.is_some() {
                    missing.push("kb_item_created".to_string());
                }
                if record.kb_item_path.is_none() {
                    missing.push("kb_item_path".to_string());
                }
            }
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => {}
        }
        missing
    }

    fn is_eligible(phase: ProcessingPhase, record: &ItemRecord) -> bool {
        match phase {
            ProcessingPhase::Cache => true,
            ProcessingPhase::Media => record.cache.complete && record.cache.error.is_none(),
            ProcessingPhase::Llm => record.cache.complete && record.cache.error.is_none() && record.media.error.is_none(),
            ProcessingPhase::KbItem => {
                record.cache.error.is_none()
                    && record.media.error.is_none()
                    && record.llm.error.is_none()
                    && record.llm.complete
                    && record.main_category.is_some()
                    && record.item_name_suggestion.is_some()
            }
            ProcessingPhase::DbSync => {
                record.cache.error.is_none()
                    && record.media.error.is_none()
                    && record.llm.error.is_none()
                    && record.kb_item.error.is_none()
                    && record.kb_item.complete
                    && record.main_category.is_some()
                    && record.item_name_suggestion.is_some()
                    && record.kb_item_path.is_some()
            }
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => false,
        }
    }

    fn needs_processing(phase: ProcessingPhase, record: &ItemRecord, force: &ForceFlags) -> bool {
        match phase {
            ProcessingPhase::Cache => force.force_recache_items || !record.cache.complete,
            ProcessingPhase::Media => force.force_reprocess_media || !record.media.complete,
            ProcessingPhase::Llm => force.force_reprocess_llm || !record.llm.complete,
            ProcessingPhase::KbItem => force.force_reprocess_kb_item || !record.kb_item.complete,
            // Regenerating the kb item implies the db row is stale too.
            ProcessingPhase::DbSync => force.force_reprocess_kb_item || !record.db_sync.complete,
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => false,
        }
    }

    /// Build the plan for a single per-item phase across `items`.
    pub fn plan_for_phase(
        phase: ProcessingPhase,
        items: &HashMap<String, ItemRecord>,
        force: &ForceFlags,
        trigger: &GlobalTrigger,
    ) -> PhasePlan {
        if phase.is_global() {
            return Self::plan_for_global_phase(phase, items, force, trigger);
        }

        let mut plan = PhasePlan {
            phase: Some(phase),
            ..Default::default()
        };

        for record in items.values() {
            if !Self::is_eligible(phase, record) {
                plan.ineligible.push(record.item_id.clone());
                continue;
            }
            if Self::needs_processing(phase, record, force) {
                plan.needs_processing.push(record.item_id.clone());
            } else {
                plan.already_complete.push(record.item_id.clone());
            }
        }

        plan
    }

    /// Synthesis/embedding are global: the planner returns a single
    /// pseudo-entry in `needs_processing` or `already_complete` depending on
    /// the force flag or the new-items-since-last-run threshold, never a
    /// per-item partition.
    fn plan_for_global_phase(
        phase: ProcessingPhase,
        items: &HashMap<String, ItemRecord>,
        force: &ForceFlags,
        trigger: &GlobalTrigger,
    ) -> PhasePlan {
        let threshold_met = trigger.new_items_since_last_run >= trigger.min_new_items_for_synthesis.max(1);
        let triggered = match phase {
            ProcessingPhase::Synthesis => force.force_regenerate_synthesis || threshold_met,
            ProcessingPhase::Embedding => force.force_regenerate_embeddings || threshold_met,
            _ => unreachable!("plan_for_global_phase called with a non-global phase"),
        };

        let mut plan = PhasePlan {
            phase: Some(phase),
            ..Default::default()
        };
        if triggered && !items.is_empty() {
            plan.needs_processing.push(GLOBAL_PHASE_ENTRY.to_string());
        } else {
            plan.already_complete.push(GLOBAL_PHASE_ENTRY.to_string());
        }
        plan
    }

    pub fn plan_all_phases(
        items: &HashMap<String, ItemRecord>,
        force: &ForceFlags,
        trigger: &GlobalTrigger,
    ) -> HashMap<ProcessingPhase, PhasePlan> {
        ProcessingPhase::ALL
            .iter()
            .map(|phase| (*phase, Self::plan_for_phase(*phase, items, force, trigger)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> ItemRecord {
        ItemRecord::new(id, id, "bookmarks")
    }

    #[test]
    fn gated_eligibility_media_phase() {
        let mut a = item("A");
        a.cache.complete = true;

        let b = item("B"); // cache not complete

        let items: HashMap<String, ItemRecord> =
            [("A".to_string(), a), ("B".to_string(), b)].into_iter().collect();

        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Media, &items, &ForceFlags::default(), &GlobalTrigger::default());

        assert_eq!(plan.needs_processing, vec!["A".to_string()]);
        assert!(plan.already_complete.is_empty());
        assert_eq!(plan.ineligible, vec!["B".to_string()]);
    }

    #[test]
    fn partition_is_disjoint_and_covers_every_item() {
        let mut items = HashMap::new();
        for i in 0..5 {
            let mut rec = item(&format!("T{i}"));
            rec.cache.complete = i % 2 == 0;
            items.insert(rec.item_id.clone(), rec);
        }

        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Media, &items, &ForceFlags::default(), &GlobalTrigger::default());
        let mut all: Vec<String> = plan
            .needs_processing
            .iter()
            .chain(plan.already_complete.iter())
            .chain(plan.ineligible.iter())
            .cloned()
            .collect();
        all.sort();
        let mut expected: Vec<String> = items.keys().cloned().collect();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn llm_is_eligible_once_cache_is_done_even_if_media_was_never_attempted() {
        // A run cancelled between the Media and Llm sub-phases leaves
        // media.complete = false with no error; Llm must still be eligible,
        // not parked in `ineligible`.
        let mut rec = item("A");
        rec.cache.complete = true;

        let items: HashMap<String, ItemRecord> = [("A".to_string(), rec.clone())].into_iter().collect();
        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Llm, &items, &ForceFlags::default(), &GlobalTrigger::default());
        assert_eq!(plan.needs_processing, vec!["A".to_string()]);

        rec.media.error = Some("boom".to_string());
        let items: HashMap<String, ItemRecord> = [("A".to_string(), rec)].into_iter().collect();
        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Llm, &items, &ForceFlags::default(), &GlobalTrigger::default());
        assert_eq!(plan.ineligible, vec!["A".to_string()]);
    }

    #[test]
    fn kb_item_requires_category_and_name_suggestion() {
        let mut rec = item("A");
        rec.cache.complete = true;
        rec.media.complete = true;
        rec.llm.complete = true;
        // main_category / item_name_suggestion left unset.

        let items: HashMap<String, ItemRecord> = [("A".to_string(), rec)].into_iter().collect();
        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::KbItem, &items, &ForceFlags::default(), &GlobalTrigger::default());
        assert_eq!(plan.ineligible, vec!["A".to_string()]);
    }

    #[test]
    fn global_phase_plan_is_a_single_pseudo_entry() {
        let mut items = HashMap::new();
        items.insert("A".to_string(), item("A"));

        let trigger = GlobalTrigger {
            new_items_since_last_run: 1,
            min_new_items_for_synthesis: 1,
        };
        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Synthesis, &items, &ForceFlags::default(), &trigger);
        assert_eq!(plan.needs_processing, vec![GLOBAL_PHASE_ENTRY.to_string()]);
        assert!(plan.ineligible.is_empty());
    }

    #[test]
    fn global_phase_below_threshold_is_already_complete() {
        let mut items = HashMap::new();
        items.insert("A".to_string(), item("A"));

        let trigger = GlobalTrigger {
            new_items_since_last_run: 0,
            min_new_items_for_synthesis: 1,
        };
        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Synthesis, &items, &ForceFlags::default(), &trigger);
        assert_eq!(plan.already_complete, vec![GLOBAL_PHASE_ENTRY.to_string()]);
    }

    #[test]
    fn force_flag_reprocesses_already_complete_items() {
        let mut rec = item("A");
        rec.cache.complete = true;
        let items: HashMap<String, ItemRecord> = [("A".to_string(), rec)].into_iter().collect();

        let force = ForceFlags {
            force_recache_items: true,
            ..Default::default()
        };
        let plan = PhasePlanner::plan_for_phase(ProcessingPhase::Cache, &items, &force, &GlobalTrigger::default());
        assert_eq!(plan.needs_processing, vec!["A".to_string()]);
    }
}
