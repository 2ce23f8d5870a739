use thiserror::Error;

/// Platform-wide error taxonomy.
///
/// Every subsystem maps its failures into one of these kinds so that retry
/// and requeue decisions can be made uniformly at the call site.
#[derive(Error, Debug)]
pub enum ManoError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("resource {kind}/{name} {problem}")]
    Resource {
        kind: String,
        name: String,
        problem: String,
    },

    #[error("external service rejected request: {service} - {message}")]
    External { service: String, message: String },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManoError>;

impl ManoError {
    /// Whether an in-place retry with backoff may reasonably succeed.
    /// Infrastructure failures (auth denied, endpoint misconfigured) are not
    /// retried per call; the reconcile loop requeues them instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ManoError::Transient(_) | ManoError::Timeout { .. } | ManoError::Io(_)
        )
    }

    /// Validation and configuration failures require operator action and are
    /// never retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ManoError::Validation(_) | ManoError::Configuration(_)
        )
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ManoError::Resource {
            kind: kind.into(),
            name: name.into(),
            problem: "not found".to_string(),
        }
    }

    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ManoError::Resource {
            kind: kind.into(),
            name: name.into(),
            problem: "conflict".to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ManoError::Resource { problem, .. } if problem == "not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ManoError::Transient("503".into()).is_retryable());
        assert!(ManoError::Timeout { timeout_ms: 5000 }.is_retryable());
        assert!(!ManoError::Validation("bad".into()).is_retryable());
        assert!(!ManoError::Cancelled.is_retryable());
    }

    #[test]
    fn validation_is_fatal() {
        assert!(ManoError::Validation("bandwidth out of range".into()).is_fatal());
        assert!(!ManoError::Transient("reset".into()).is_fatal());
    }

    #[test]
    fn not_found_helper_round_trips() {
        let err = ManoError::not_found("vnf", "ran-edge01");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("ran-edge01"));
    }
}
