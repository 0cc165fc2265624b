//! Root configuration, loaded from `kba.toml`.
//!
//! A `#[serde(default)]` struct tree deserialized with `toml`, normalized,
//! then checked by a `validate()` pass that accumulates every problem
//! instead of failing on the first.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::retry_manager::RetryConfig;
use crate::types::ScheduleDefinition;

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct KbaConfig {
    pub project: ProjectConfig,
    pub storage: StorageConfig,
    pub backends: HashMap<String, BackendConfig>,
    pub retry: RetryConfig,
    pub runtime: RuntimeConfig,
    pub pipelines: HashMap<String, ScheduleDefinition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub data_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            name: "knowledge-base".to_string(),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub items_path: String,
    pub stats_path: String,
    pub task_history_retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            items_path: "data/items.json".to_string(),
            stats_path: "data/stats.json".to_string(),
            task_history_retention_days: 7,
        }
    }
}

/// One configured AI backend, keyed in `KbaConfig::backends` by the logical
/// phase name it serves (`"media"`, `"llm"`, `"kb_item"`, `"synthesis"`,
/// `"embedding"`). Mirrors the fields `ModelRouter::register_phase` needs.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub backend_name: String,
    pub model: String,
    pub binary_name: String,
    pub extra_args: Vec<String>,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub embedding_dimensions: Option<u32>,
    pub requires_streaming: bool,
    pub requires_vision: bool,
    pub requires_embedding: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            backend_name: "default".to_string(),
            model: "default-model".to_string(),
            binary_name: "kba-model-cli".to_string(),
            extra_args: Vec::new(),
            supports_streaming: false,
            supports_vision: false,
            embedding_dimensions: None,
            requires_streaming: false,
            requires_vision: false,
            requires_embedding: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on items submitted to TaskRuntime per batch within a phase.
    pub batch_size: usize,
    /// Per-item fan-out inside a single job, per the concurrency model's default of 4.
    pub item_fan_out: usize,
    pub text_timeout_seconds: u64,
    pub vision_timeout_seconds: u64,
    /// A per-item phase is declared failed once more than this fraction of
    /// its eligible items error out; any global-phase failure always counts.
    pub failure_rate_threshold: f64,
    /// New items fetched in a run must meet or exceed this count to trigger
    /// synthesis/embedding regeneration (absent a force flag).
    pub min_new_items_for_synthesis: usize,
    /// Interval between phase-engine polls of in-flight TaskRuntime jobs.
    pub progress_poll_interval_ms: u64,
    /// Interval between Scheduler evaluations of due `ScheduleDefinition`s.
    pub schedule_poll_interval_seconds: u64,
    /// Fail fast (`true`) or enqueue (`false`) a `start` request that arrives
    /// while a run is already in progress.
    pub start_fails_fast_when_running: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            batch_size: 10,
            item_fan_out: 4,
            text_timeout_seconds: 180,
            vision_timeout_seconds: 300,
            failure_rate_threshold: 0.5,
            min_new_items_for_synthesis: 1,
            progress_poll_interval_ms: 200,
            schedule_poll_interval_seconds: 30,
            start_fails_fast_when_running: true,
        }
    }
}

pub fn validate(config: &KbaConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.runtime.batch_size == 0 {
        errors.push("runtime.batch_size must be >= 1".to_string());
    }
    if config.runtime.item_fan_out == 0 {
        errors.push("runtime.item_fan_out must be >= 1".to_string());
    }
    if !(0.0..=1.0).contains(&config.runtime.failure_rate_threshold) {
        errors.push("runtime.failure_rate_threshold must be within [0.0, 1.0]".to_string());
    }
    if config.retry.max_retries == 0 && config.retry.strategy != crate::types::RetryStrategy::None {
        errors.push("retry.max_retries must be >= 1 unless retry.strategy is \"none\"".to_string());
    }
    if config.storage.items_path.is_empty() {
        errors.push("storage.items_path must not be empty".to_string());
    }
    if config.storage.stats_path.is_empty() {
        errors.push("storage.stats_path must not be empty".to_string());
    }

    for (phase_name, backend) in &config.backends {
        if backend.binary_name.trim().is_empty() {
            errors.push(format!("backends.{phase_name}: binary_name must not be empty"));
        }
        if backend.requires_vision && !backend.supports_vision {
            errors.push(format!(
                "backends.{phase_name}: requires_vision is set but supports_vision is false"
            ));
        }
        if backend.requires_embedding && backend.embedding_dimensions.is_none() {
            errors.push(format!(
                "backends.{phase_name}: requires_embedding is set but embedding_dimensions is unset"
            ));
        }
    }

    for (schedule_name, schedule) in &config.pipelines {
        if schedule.frequency == crate::types::ScheduleFrequency::CustomCron && schedule.cron_expr.is_none() {
            errors.push(format!(
                "pipelines.{schedule_name}: frequency is custom_cron but cron_expr is unset"
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/kba.toml`. When `config_path` is `Some`, the file MUST
/// exist. When `None`, a missing `kba.toml` yields defaults rather than an error.
pub fn load_config_from(config_path: Option<&Path>, project_root: &Path) -> Result<KbaConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

fn load_config_at(path: &Path) -> Result<KbaConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }
    let contents = std::fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_and_validate(&contents, path)
}

pub fn load_config(project_root: &Path) -> Result<KbaConfig, String> {
    let config_path = project_root.join("kba.toml");
    if !config_path.exists() {
        return Ok(KbaConfig::default());
    }
    let contents =
        std::fs::read_to_string(&config_path).map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;
    parse_and_validate(&contents, &config_path)
}

fn parse_and_validate(contents: &str, path: &Path) -> Result<KbaConfig, String> {
    let config: KbaConfig = toml::from_str(contents).map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n")
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&KbaConfig::default()).is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = KbaConfig::default();
        config.runtime.batch_size = 0;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("batch_size")));
    }

    #[test]
    fn failure_rate_threshold_out_of_range_is_rejected() {
        let mut config = KbaConfig::default();
        config.runtime.failure_rate_threshold = 1.5;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("failure_rate_threshold")));
    }

    #[test]
    fn backend_requiring_vision_without_support_is_rejected() {
        let mut config = KbaConfig::default();
        config.backends.insert(
            "media".to_string(),
            BackendConfig {
                requires_vision: true,
                supports_vision: false,
                ..BackendConfig::default()
            },
        );
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("requires_vision")));
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config, KbaConfig::default());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config_from(Some(&missing), dir.path()).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn loads_and_validates_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kba.toml");
        std::fs::write(
            &path,
            r#"
            [project]
            name = "test-kb"

            [runtime]
            batch_size = 5
            "#,
        )
        .unwrap();

        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.project.name, "test-kb");
        assert_eq!(config.runtime.batch_size, 5);
    }
}
