use thiserror::Error;
use crate::types::NodeId;

/// Main error type for the Tidechain consensus engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Delegate not found: {0}")]
    DelegateNotFound(NodeId),

    #[error("Engine stopped")]
    EngineStopped,

    #[error("Invalid shard configuration: {0}")]
    InvalidShardConfiguration(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Check if the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Internal(_))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::Internal(_) => ErrorSeverity::Critical,
            EngineError::Config(_) => ErrorSeverity::High,
            EngineError::InvalidShardConfiguration(_) => ErrorSeverity::High,
            EngineError::EngineStopped => ErrorSeverity::Medium,
            EngineError::Serialization(_) => ErrorSeverity::Medium,
            EngineError::DelegateNotFound(_) => ErrorSeverity::Low,
            EngineError::ValidationFailed(_) => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl From<::config::ConfigError> for EngineError {
    fn from(err: ::config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Macro for logging an error before returning it
#[macro_export]
macro_rules! engine_bail {
    ($error:expr, $operation:expr) => {{
        let error = $error;
        $crate::tracing::warn!(error = %error, operation = $operation, "Engine operation failed");
        return Err(error);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::DelegateNotFound(NodeId::new("node9"));
        assert_eq!(err.to_string(), "Delegate not found: node9");

        let err = EngineError::ValidationFailed("insufficient signatures".to_string());
        assert_eq!(err.to_string(), "Validation failed: insufficient signatures");
    }

    #[test]
    fn test_severity() {
        assert_eq!(EngineError::EngineStopped.severity(), ErrorSeverity::Medium);
        assert_eq!(
            EngineError::InvalidShardConfiguration("zero shards".to_string()).severity(),
            ErrorSeverity::High
        );
        assert!(!EngineError::EngineStopped.is_retryable());
    }

    fn stopped_lookup() -> EngineResult<u64> {
        crate::engine_bail!(EngineError::EngineStopped, "lookup");
    }

    #[test]
    fn test_bail_logs_through_reexport() {
        crate::logging::init_test_tracing();
        assert!(matches!(stopped_lookup(), Err(EngineError::EngineStopped)));
    }
}
