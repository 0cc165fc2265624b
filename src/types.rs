use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The fine-grained processing phases tracked on an [`ItemRecord`].
///
/// `Synthesis` and `Embedding` are "global" phases: they run once per pipeline
/// run rather than once per item, and have no corresponding per-item
/// completion flag.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    Cache,
    Media,
    Llm,
    KbItem,
    DbSync,
    Synthesis,
    Embedding,
}

impl ProcessingPhase {
    pub const ALL: [ProcessingPhase; 7] = [
        ProcessingPhase::Cache,
        ProcessingPhase::Media,
        ProcessingPhase::Llm,
        ProcessingPhase::KbItem,
        ProcessingPhase::DbSync,
        ProcessingPhase::Synthesis,
        ProcessingPhase::Embedding,
    ];

    pub fn is_global(&self) -> bool {
        matches!(self, ProcessingPhase::Synthesis | ProcessingPhase::Embedding)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::Cache => "cache",
            ProcessingPhase::Media => "media",
            ProcessingPhase::Llm => "llm",
            ProcessingPhase::KbItem => "kb_item",
            ProcessingPhase::DbSync => "db_sync",
            ProcessingPhase::Synthesis => "synthesis",
            ProcessingPhase::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The seven coarse run-level phases the pipeline engine executes in fixed
/// order. `ContentProcessing` fans out internally into the
/// [`ProcessingPhase`] sub-phases for media/llm/kb_item/db_sync.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initialization,
    FetchBookmarks,
    ContentProcessing,
    SynthesisGeneration,
    EmbeddingGeneration,
    ReadmeGeneration,
    GitSync,
}

impl RunPhase {
    pub const ORDER: [RunPhase; 7] = [
        RunPhase::Initialization,
        RunPhase::FetchBookmarks,
        RunPhase::ContentProcessing,
        RunPhase::SynthesisGeneration,
        RunPhase::EmbeddingGeneration,
        RunPhase::ReadmeGeneration,
        RunPhase::GitSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Initialization => "initialization",
            RunPhase::FetchBookmarks => "fetch_bookmarks",
            RunPhase::ContentProcessing => "content_processing",
            RunPhase::SynthesisGeneration => "synthesis_generation",
            RunPhase::EmbeddingGeneration => "embedding_generation",
            RunPhase::ReadmeGeneration => "readme_generation",
            RunPhase::GitSync => "git_sync",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct MediaRef {
    pub media_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct CategoriesStructured {
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub sub: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    NetworkError,
    RateLimit,
    ConfigurationError,
    DataError,
    PermanentError,
    TemporaryError,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::NetworkError => "NETWORK_ERROR",
            FailureType::RateLimit => "RATE_LIMIT",
            FailureType::ConfigurationError => "CONFIGURATION_ERROR",
            FailureType::DataError => "DATA_ERROR",
            FailureType::PermanentError => "PERMANENT_ERROR",
            FailureType::TemporaryError => "TEMPORARY_ERROR",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Immediate,
    None,
}

/// A single recorded retry attempt, appended to `ItemRecord::retry_history`.
///
/// The history is bounded (see `crate::retry_manager::RETRY_HISTORY_CAPACITY`);
/// the oldest entry is dropped once the cap is reached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub failure_type: FailureType,
    pub error_message: String,
    pub delay_seconds: f64,
    pub attempted_at: DateTime<Utc>,
}

/// Per-phase flag/error pair bundle, reducing repetition in [`ItemRecord`]
/// accessors that need to read or write "the flag and error for phase P" generically.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PhaseOutcome {
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub succeeded_this_run: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemRecord {
    pub item_id: String,
    pub bookmarked_item_id: String,
    pub source: String,

    #[serde(default)]
    pub raw_content: serde_json::Value,
    #[serde(default)]
    pub display_title: String,
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub media_refs: Vec<MediaRef>,

    #[serde(default)]
    pub is_thread: bool,
    #[serde(default)]
    pub thread_items: Vec<serde_json::Value>,

    #[serde(default)]
    pub cache: PhaseOutcome,
    #[serde(default)]
    pub media: PhaseOutcome,
    #[serde(default)]
    pub llm: PhaseOutcome,
    #[serde(default)]
    pub kb_item: PhaseOutcome,
    #[serde(default)]
    pub db_sync: PhaseOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<CategoriesStructured>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_item_path: Option<String>,
    #[serde(default)]
    pub kb_media_paths: Vec<String>,

    #[serde(default)]
    pub force_reprocess_pipeline: bool,
    #[serde(default)]
    pub force_recache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprocess_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprocess_requested_by: Option<String>,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(default)]
    pub retry_history: VecDeque<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemRecord {
    pub fn new(item_id: impl Into<String>, bookmarked_item_id: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        ItemRecord {
            item_id: item_id.into(),
            bookmarked_item_id: bookmarked_item_id.into(),
            source: source.into(),
            raw_content: serde_json::Value::Null,
            display_title: String::new(),
            full_text: String::new(),
            media_refs: Vec::new(),
            is_thread: false,
            thread_items: Vec::new(),
            cache: PhaseOutcome::default(),
            media: PhaseOutcome::default(),
            llm: PhaseOutcome::default(),
            kb_item: PhaseOutcome::default(),
            db_sync: PhaseOutcome::default(),
            main_category: None,
            sub_category: None,
            item_name_suggestion: None,
            categories: None,
            kb_item_path: None,
            kb_media_paths: Vec::new(),
            force_reprocess_pipeline: false,
            force_recache: false,
            reprocess_requested_at: None,
            reprocess_requested_by: None,
            retry_count: 0,
            last_retry_attempt: None,
            next_retry_after: None,
            failure_type: None,
            retry_history: VecDeque::new(),
            circuit_breaker_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Read-only access to the flag/error pair for a per-item phase.
    /// Returns `None` for the two global phases, which have no per-item outcome.
    pub fn outcome(&self, phase: ProcessingPhase) -> Option<&PhaseOutcome> {
        match phase {
            ProcessingPhase::Cache => Some(&self.cache),
            ProcessingPhase::Media => Some(&self.media),
            ProcessingPhase::Llm => Some(&self.llm),
            ProcessingPhase::KbItem => Some(&self.kb_item),
            ProcessingPhase::DbSync => Some(&self.db_sync),
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => None,
        }
    }

    pub fn outcome_mut(&mut self, phase: ProcessingPhase) -> Option<&mut PhaseOutcome> {
        match phase {
            ProcessingPhase::Cache => Some(&mut self.cache),
            ProcessingPhase::Media => Some(&mut self.media),
            ProcessingPhase::Llm => Some(&mut self.llm),
            ProcessingPhase::KbItem => Some(&mut self.kb_item),
            ProcessingPhase::DbSync => Some(&mut self.db_sync),
            ProcessingPhase::Synthesis | ProcessingPhase::Embedding => None,
        }
    }

    /// Any per-item phase's error annotation is set.
    pub fn has_any_error(&self) -> bool {
        [&self.cache, &self.media, &self.llm, &self.kb_item, &self.db_sync]
            .iter()
            .any(|o| o.error.is_some())
    }
}

/// A partial update to an [`ItemRecord`]. Every plain field is `Option<T>`
/// ("leave unset" vs. "overwrite"); nullable fields use `Option<Option<T>>`
/// so that "leave unset" and "explicitly clear" are distinguishable.
///
/// `ItemStore::upsert` merges this field-by-field with last-writer-wins,
/// preserving every field the patch leaves `None`. A handful of compound
/// operations (`set_flags`, retry bookkeeping) are modeled as dedicated
/// `ItemStore` operations rather than patch fields, since they must be
/// atomic read-modify-write over more than one field at once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemPatch {
    pub raw_content: Option<serde_json::Value>,
    pub display_title: Option<String>,
    pub full_text: Option<String>,
    pub media_refs: Option<Vec<MediaRef>>,
    pub is_thread: Option<bool>,
    pub thread_items: Option<Vec<serde_json::Value>>,
    pub main_category: Option<Option<String>>,
    pub sub_category: Option<Option<String>>,
    pub item_name_suggestion: Option<Option<String>>,
    pub categories: Option<Option<CategoriesStructured>>,
    pub kb_item_path: Option<Option<String>>,
    pub kb_media_paths: Option<Vec<String>>,
    pub force_reprocess_pipeline: Option<bool>,
    pub force_recache: Option<bool>,
    pub reprocess_requested_at: Option<Option<DateTime<Utc>>>,
    pub reprocess_requested_by: Option<Option<String>>,
}

impl ItemPatch {
    pub fn apply(self, record: &mut ItemRecord) {
        if let Some(v) = self.raw_content {
            record.raw_content = v;
        }
        if let Some(v) = self.display_title {
            record.display_title = v;
        }
        if let Some(v) = self.full_text {
            record.full_text = v;
        }
        if let Some(v) = self.media_refs {
            record.media_refs = v;
        }
        if let Some(v) = self.is_thread {
            record.is_thread = v;
        }
        if let Some(v) = self.thread_items {
            record.thread_items = v;
        }
        if let Some(v) = self.main_category {
            record.main_category = v;
        }
        if let Some(v) = self.sub_category {
            record.sub_category = v;
        }
        if let Some(v) = self.item_name_suggestion {
            record.item_name_suggestion = v;
        }
        if let Some(v) = self.categories {
            record.categories = v;
        }
        if let Some(v) = self.kb_item_path {
            record.kb_item_path = v;
        }
        if let Some(v) = self.kb_media_paths {
            record.kb_media_paths = v;
        }
        if let Some(v) = self.force_reprocess_pipeline {
            record.force_reprocess_pipeline = v;
        }
        if let Some(v) = self.force_recache {
            record.force_recache = v;
        }
        if let Some(v) = self.reprocess_requested_at {
            record.reprocess_requested_at = v;
        }
        if let Some(v) = self.reprocess_requested_by {
            record.reprocess_requested_by = v;
        }
        record.updated_at = Utc::now();
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PhaseExecution,
    ItemBatch,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskProgress {
    pub current: u64,
    pub total: u64,
}

impl TaskProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskState {
    pub task_id: uuid::Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<uuid::Uuid>,
}

impl TaskState {
    pub fn new(task_type: TaskType, phase: Option<String>) -> Self {
        TaskState {
            task_id: uuid::Uuid::new_v4(),
            task_type,
            status: TaskStatus::Pending,
            progress: None,
            phase,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            parent_task_id: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AgentState {
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<uuid::Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_requested: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Manual,
    Daily,
    Weekly,
    Monthly,
    CustomCron,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScheduleDefinition {
    pub name: String,
    pub frequency: ScheduleFrequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pipeline_config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScheduleRun {
    pub schedule_name: String,
    pub task_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PhaseStats {
    pub total_items_processed: u64,
    pub total_duration_seconds: f64,
    pub avg_time_per_item_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_record_outcome_global_phases_have_no_per_item_state() {
        let record = ItemRecord::new("T1", "T1", "bookmarks");
        assert!(record.outcome(ProcessingPhase::Synthesis).is_none());
        assert!(record.outcome(ProcessingPhase::Embedding).is_none());
        assert!(record.outcome(ProcessingPhase::Cache).is_some());
    }

    #[test]
    fn item_patch_leaves_unset_fields_untouched() {
        let mut record = ItemRecord::new("T1", "T1", "bookmarks");
        record.display_title = "original".to_string();
        record.full_text = "original text".to_string();

        let patch = ItemPatch {
            full_text: Some("updated text".to_string()),
            ..Default::default()
        };
        patch.apply(&mut record);

        assert_eq!(record.display_title, "original");
        assert_eq!(record.full_text, "updated text");
    }

    #[test]
    fn item_patch_can_explicitly_clear_nullable_field() {
        let mut record = ItemRecord::new("T1", "T1", "bookmarks");
        record.main_category = Some("tech".to_string());

        let patch = ItemPatch {
            main_category: Some(None),
            ..Default::default()
        };
        patch.apply(&mut record);

        assert_eq!(record.main_category, None);
    }

    #[test]
    fn task_progress_fraction_clamped() {
        let p = TaskProgress { current: 5, total: 0 };
        assert_eq!(p.fraction(), 0.0);
        let p = TaskProgress { current: 10, total: 5 };
        assert_eq!(p.fraction(), 1.0);
    }
}
