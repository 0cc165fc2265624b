//! Failure classification, backoff scheduling, and per-item circuit breakers.
//!
//! Constants and heuristics here are taken directly from the original
//! retry manager: substring classification over error text, a 10x rate-limit
//! multiplier, `[0.8, 1.2]` uniform jitter, and a 60-minute default breaker
//! cool-off.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

use crate::error::KbaError;
use crate::types::{FailureType, ItemRecord, RetryAttempt, RetryStrategy};

/// Bound on `ItemRecord::retry_history`; oldest entries are evicted first.
pub const RETRY_HISTORY_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub exponential_factor: f64,
    pub jitter: bool,
    pub strategy: RetryStrategy,
    pub circuit_breaker_minutes: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_seconds: 1.0,
            max_delay_seconds: 300.0,
            exponential_factor: 2.0,
            jitter: true,
            strategy: RetryStrategy::Exponential,
            circuit_breaker_minutes: 60,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryStatistics {
    pub total_items_with_retries: usize,
    pub active_circuit_breakers: usize,
    pub network_error_count: usize,
    pub rate_limit_count: usize,
    pub configuration_error_count: usize,
    pub data_error_count: usize,
    pub permanent_error_count: usize,
    pub temporary_error_count: usize,
    pub average_retries_per_item: f64,
}

/// Classify an error's free-text message using case-insensitive substring
/// heuristics. This is the documented fallback for errors that cross an
/// untyped boundary; typed [`KbaError`] values should prefer
/// [`KbaError::classify`] instead.
pub fn classify_failure_text(message: &str) -> FailureType {
    let lower = message.to_lowercase();

    let network_markers = ["connection", "timeout", "network", "dns", "socket"];
    let rate_limit_markers = ["rate limit", "too many requests", "429", "throttle"];
    let config_markers = ["config", "permission", "auth", "forbidden", "401", "403"];
    let data_markers = ["json", "parse", "format", "encoding", "validation"];
    let permanent_markers = ["not found", "404", "deleted", "suspended", "permanent"];

    if network_markers.iter().any(|m| lower.contains(m)) {
        FailureType::NetworkError
    } else if rate_limit_markers.iter().any(|m| lower.contains(m)) {
        FailureType::RateLimit
    } else if config_markers.iter().any(|m| lower.contains(m)) {
        FailureType::ConfigurationError
    } else if data_markers.iter().any(|m| lower.contains(m)) {
        FailureType::DataError
    } else if permanent_markers.iter().any(|m| lower.contains(m)) {
        FailureType::PermanentError
    } else {
        FailureType::TemporaryError
    }
}

/// Classify a typed error, preferring its own classification and falling
/// back to substring heuristics over its `Display` text.
pub fn classify_error(error: &KbaError) -> FailureType {
    error.classify().unwrap_or_else(|| classify_failure_text(&error.to_string()))
}

fn calculate_delay(config: &RetryConfig, failure_type: FailureType, attempt_number: u32) -> f64 {
    let base = if failure_type == FailureType::RateLimit {
        config.base_delay_seconds * 10.0
    } else {
        config.base_delay_seconds
    };

    let raw = match config.strategy {
        RetryStrategy::Exponential => base * config.exponential_factor.powi(attempt_number as i32 - 1),
        RetryStrategy::Linear => base * attempt_number as f64,
        RetryStrategy::Immediate => 0.0,
        RetryStrategy::None => 0.0,
    };

    let clamped = raw.min(config.max_delay_seconds);

    if config.jitter && clamped > 0.0 {
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        clamped * factor
    } else {
        clamped
    }
}

#[derive(Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        RetryManager { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether the item is eligible for another retry attempt right now.
    ///
    /// The circuit breaker overrides every other consideration: while open,
    /// this always returns `false`.
    pub fn should_retry(&self, record: &ItemRecord, failure_type: FailureType) -> bool {
        if let Some(until) = record.circuit_breaker_until {
            if until > Utc::now() {
                return false;
            }
        }

        if failure_type == FailureType::PermanentError {
            return false;
        }

        record.retry_count < self.config.max_retries
    }

    /// Record a failed attempt: bump `retry_count`, set `next_retry_after`,
    /// `failure_type`, and append a bounded history entry. Does not itself
    /// decide whether to retry — call [`Self::should_retry`] first.
    pub fn schedule_retry(&self, record: &mut ItemRecord, error_message: impl Into<String>) {
        let error_message = error_message.into();
        let failure_type = classify_failure_text(&error_message);
        let attempt_number = record.retry_count + 1;
        let delay_seconds = calculate_delay(&self.config, failure_type, attempt_number);
        let now = Utc::now();

        record.retry_count = attempt_number;
        record.last_retry_attempt = Some(now);
        record.next_retry_after = Some(now + ChronoDuration::milliseconds((delay_seconds * 1000.0) as i64));
        record.failure_type = Some(failure_type);

        record.retry_history.push_back(RetryAttempt {
            attempt_number,
            failure_type,
            error_message,
            delay_seconds,
            attempted_at: now,
        });
        while record.retry_history.len() > RETRY_HISTORY_CAPACITY {
            record.retry_history.pop_front();
        }
    }

    /// Items whose error state makes them retry candidates right now:
    /// an error is set, the breaker (if any) isn't open, and the scheduled
    /// delay has elapsed.
    pub fn get_retryable<'a>(&self, records: impl IntoIterator<Item = &'a ItemRecord>) -> Vec<String> {
        let now = Utc::now();
        records
            .into_iter()
            .filter(|r| {
                r.has_any_error()
                    && r.next_retry_after.map(|t| t <= now).unwrap_or(true)
                    && r.circuit_breaker_until.map(|t| t <= now).unwrap_or(true)
            })
            .map(|r| r.item_id.clone())
            .collect()
    }

    /// On success: wipe retry/error state for the item and close its breaker.
    pub fn clear(&self, record: &mut ItemRecord) {
        record.retry_count = 0;
        record.last_retry_attempt = None;
        record.next_retry_after = None;
        record.failure_type = None;
        record.circuit_breaker_until = None;
        record.cache.error = None;
        record.media.error = None;
        record.llm.error = None;
        record.kb_item.error = None;
        record.db_sync.error = None;
    }

    /// Manually trip the circuit breaker for `duration`.
    pub fn open_breaker(&self, record: &mut ItemRecord, duration: std::time::Duration) {
        record.circuit_breaker_until = Some(Utc::now() + ChronoDuration::from_std(duration).unwrap_or_default());
    }

    pub fn open_breaker_default(&self, record: &mut ItemRecord) {
        self.open_breaker(record, std::time::Duration::from_secs(self.config.circuit_breaker_minutes as u64 * 60));
    }

    pub fn stats<'a>(&self, records: impl IntoIterator<Item = &'a ItemRecord>) -> RetryStatistics {
        let now = Utc::now();
        let mut stats = RetryStatistics::default();
        let mut total_retries = 0u64;

        for record in records {
            if record.retry_count > 0 || record.failure_type.is_some() {
                stats.total_items_with_retries += 1;
                total_retries += record.retry_count as u64;
            }
            if record.circuit_breaker_until.map(|t| t > now).unwrap_or(false) {
                stats.active_circuit_breakers += 1;
            }
            match record.failure_type {
                Some(FailureType::NetworkError) => stats.network_error_count += 1,
                Some(FailureType::RateLimit) => stats.rate_limit_count += 1,
                Some(FailureType::ConfigurationError) => stats.configuration_error_count += 1,
                Some(FailureType::DataError) => stats.data_error_count += 1,
                Some(FailureType::PermanentError) => stats.permanent_error_count += 1,
                Some(FailureType::TemporaryError) => stats.temporary_error_count += 1,
                None => {}
            }
        }

        if stats.total_items_with_retries > 0 {
            stats.average_retries_per_item = total_retries as f64 / stats.total_items_with_retries as f64;
        }

        stats
    }
}

/// A `chrono::DateTime` in the past, useful in tests for "breaker already expired".
pub fn past(seconds_ago: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::seconds(seconds_ago)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemRecord;

    fn item() -> ItemRecord {
        ItemRecord::new("T1", "T1", "bookmarks")
    }

    #[test]
    fn classifies_network_errors() {
        assert_eq!(classify_failure_text("Connection timed out"), FailureType::NetworkError);
        assert_eq!(classify_failure_text("DNS lookup failed"), FailureType::NetworkError);
    }

    #[test]
    fn classifies_rate_limit_markers() {
        assert_eq!(classify_failure_text("429 Too Many Requests"), FailureType::RateLimit);
    }

    #[test]
    fn classifies_permanent_errors() {
        assert_eq!(classify_failure_text("404 not found"), FailureType::PermanentError);
        assert_eq!(classify_failure_text("Account suspended"), FailureType::PermanentError);
    }

    #[test]
    fn network_markers_win_over_permanent_markers() {
        // A message matching both marker sets must classify as network, not
        // permanent, so it stays retryable instead of being given up on.
        assert_eq!(
            classify_failure_text("connection reset: account suspended"),
            FailureType::NetworkError
        );
    }

    #[test]
    fn unclassified_text_defaults_to_temporary() {
        assert_eq!(classify_failure_text("something went wrong"), FailureType::TemporaryError);
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        let manager = RetryManager::new(config);
        let mut record = item();

        manager.schedule_retry(&mut record, "connection refused");
        let d1 = record.retry_history.back().unwrap().delay_seconds;
        manager.schedule_retry(&mut record, "connection refused");
        let d2 = record.retry_history.back().unwrap().delay_seconds;
        manager.schedule_retry(&mut record, "connection refused");
        let d3 = record.retry_history.back().unwrap().delay_seconds;

        assert_eq!((d1, d2, d3), (1.0, 2.0, 4.0));
        assert_eq!(record.retry_count, 3);
    }

    #[test]
    fn rate_limit_uses_ten_times_base_delay() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        let manager = RetryManager::new(config);
        let mut record = item();

        manager.schedule_retry(&mut record, "429 rate limit exceeded");
        let d1 = record.retry_history.back().unwrap().delay_seconds;
        manager.schedule_retry(&mut record, "429 rate limit exceeded");
        let d2 = record.retry_history.back().unwrap().delay_seconds;
        manager.schedule_retry(&mut record, "429 rate limit exceeded");
        let d3 = record.retry_history.back().unwrap().delay_seconds;

        assert_eq!((d1, d2, d3), (10.0, 20.0, 40.0));
    }

    #[test]
    fn permanent_errors_never_retry() {
        let manager = RetryManager::new(RetryConfig::default());
        let record = item();
        assert!(!manager.should_retry(&record, FailureType::PermanentError));
    }

    #[test]
    fn circuit_breaker_blocks_regardless_of_retry_count() {
        let manager = RetryManager::new(RetryConfig::default());
        let mut record = item();
        manager.open_breaker(&mut record, std::time::Duration::from_secs(3600));

        assert!(!manager.should_retry(&record, FailureType::NetworkError));

        // Simulate expiry.
        record.circuit_breaker_until = Some(past(1));
        assert!(manager.should_retry(&record, FailureType::NetworkError));
    }

    #[test]
    fn retries_capped_at_max_retries() {
        let manager = RetryManager::new(RetryConfig::default());
        let mut record = item();
        record.retry_count = 3;
        assert!(!manager.should_retry(&record, FailureType::NetworkError));
    }

    #[test]
    fn clear_wipes_retry_and_error_state() {
        let manager = RetryManager::new(RetryConfig::default());
        let mut record = item();
        manager.schedule_retry(&mut record, "connection refused");
        record.cache.error = Some("boom".to_string());
        manager.open_breaker(&mut record, std::time::Duration::from_secs(60));

        manager.clear(&mut record);

        assert_eq!(record.retry_count, 0);
        assert_eq!(record.failure_type, None);
        assert_eq!(record.cache.error, None);
        assert_eq!(record.circuit_breaker_until, None);
    }

    #[test]
    fn retry_history_bounded_at_capacity() {
        let manager = RetryManager::new(RetryConfig {
            max_retries: 100,
            ..RetryConfig::default()
        });
        let mut record = item();
        for _ in 0..(RETRY_HISTORY_CAPACITY + 5) {
            manager.schedule_retry(&mut record, "connection refused");
        }
        assert_eq!(record.retry_history.len(), RETRY_HISTORY_CAPACITY);
    }

    #[test]
    fn get_retryable_respects_next_retry_after() {
        let manager = RetryManager::new(RetryConfig::default());
        let mut due = item();
        due.item_id = "due".to_string();
        due.cache.error = Some("boom".to_string());
        due.next_retry_after = Some(past(5));

        let mut not_due = item();
        not_due.item_id = "not_due".to_string();
        not_due.cache.error = Some("boom".to_string());
        not_due.next_retry_after = Some(Utc::now() + ChronoDuration::seconds(3600));

        let retryable = manager.get_retryable([&due, &not_due]);
        assert_eq!(retryable, vec!["due".to_string()]);
    }
}
