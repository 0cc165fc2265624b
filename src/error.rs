use crate::types::FailureType;

/// Crate-wide error taxonomy. Each variant corresponds to a row of the error
/// handling table: which component raises it, and how the RetryManager and
/// PipelineEngine dispose of it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KbaError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("model router misconfigured: {0}")]
    ModelRouter(String),

    #[error("backend {backend} lacks capability {capability} required for phase {phase}")]
    Capability {
        backend: String,
        capability: String,
        phase: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("worker lost (missed {missed_heartbeats} heartbeats)")]
    WorkerLost { missed_heartbeats: u32 },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl KbaError {
    /// Maps a typed error directly to its [`FailureType`] classification,
    /// bypassing the substring heuristics in `retry_manager` entirely.
    ///
    /// This is the typed-error fast path the design notes call for; the
    /// substring classifier remains the fallback for errors that cross an
    /// untyped boundary (subprocess exit text, raw backend error strings).
    pub fn classify(&self) -> Option<FailureType> {
        match self {
            KbaError::Network(_) | KbaError::Timeout(_) => Some(FailureType::NetworkError),
            KbaError::RateLimit(_) => Some(FailureType::RateLimit),
            KbaError::Data(_) => Some(FailureType::DataError),
            KbaError::Permanent(_) => Some(FailureType::PermanentError),
            KbaError::Config(_) => Some(FailureType::ConfigurationError),
            // Storage/ModelRouter/Capability/Cancelled/WorkerLost/Other are not
            // classified into the item-level retry taxonomy; they are handled
            // at the task or run level instead (see PipelineEngine/TaskRuntime).
            _ => None,
        }
    }

    /// Errors that abort the whole run rather than just the current phase or item.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, KbaError::ModelRouter(_) | KbaError::Capability { .. } | KbaError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_classify_as_network_error() {
        assert_eq!(
            KbaError::Network("connection refused".into()).classify(),
            Some(FailureType::NetworkError)
        );
        assert_eq!(
            KbaError::Timeout(std::time::Duration::from_secs(180)).classify(),
            Some(FailureType::NetworkError)
        );
    }

    #[test]
    fn capability_error_is_run_fatal() {
        let err = KbaError::Capability {
            backend: "ollama".into(),
            capability: "vision".into(),
            phase: "media".into(),
        };
        assert!(err.is_run_fatal());
        assert_eq!(err.classify(), None);
    }
}
