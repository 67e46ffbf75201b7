//! Error types for the Kolosal deployment engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// Main error type for routing, monitoring and retraining
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Invalid routing strategy: {0}")]
    InvalidStrategy(String),

    #[error("No candidate model configured")]
    NoCandidate,

    #[error("Model {version} unavailable: {reason}")]
    ModelUnavailable { version: String, reason: String },

    #[error("Detector not fitted")]
    NotFitted,

    #[error("Insufficient data: need at least {required} samples, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Retraining job {job_id} already in flight")]
    RetrainingInFlight { job_id: String },

    #[error("Retraining job {job_id} failed: {reason}")]
    RetrainingFailed { job_id: String, reason: String },

    #[error("Cannot {action} while {phase}")]
    InvalidTransition { phase: String, action: String },

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Alert handler {handler} failed: {reason}")]
    HandlerError { handler: String, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Stable discriminant of a [`DeployError`], for callers that map errors to
/// response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidStrategy,
    NoCandidate,
    ModelUnavailable,
    NotFitted,
    InsufficientData,
    RetrainingInFlight,
    RetrainingFailed,
    InvalidTransition,
    InvalidInput,
    Config,
    Internal,
}

impl DeployError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::InvalidStrategy(_) => ErrorKind::InvalidStrategy,
            DeployError::NoCandidate => ErrorKind::NoCandidate,
            DeployError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            DeployError::NotFitted => ErrorKind::NotFitted,
            DeployError::InsufficientData { .. } => ErrorKind::InsufficientData,
            DeployError::RetrainingInFlight { .. } => ErrorKind::RetrainingInFlight,
            DeployError::RetrainingFailed { .. } => ErrorKind::RetrainingFailed,
            DeployError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DeployError::ShapeError { .. } | DeployError::ValidationError(_) => {
                ErrorKind::InvalidInput
            }
            DeployError::InvalidParameter { .. } | DeployError::ConfigError(_) => ErrorKind::Config,
            DeployError::SerializationError(_)
            | DeployError::HandlerError { .. }
            | DeployError::ChannelClosed(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for a model invocation failure
    pub fn model_unavailable(version: impl Into<String>, reason: impl Into<String>) -> Self {
        DeployError::ModelUnavailable {
            version: version.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_parameter(
        name: &str,
        value: impl std::fmt::Display,
        reason: &str,
    ) -> Self {
        DeployError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for DeployError {
    fn from(err: serde_json::Error) -> Self {
        DeployError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for DeployError {
    fn from(err: ndarray::ShapeError) -> Self {
        DeployError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::InsufficientData { required: 30, actual: 5 };
        assert_eq!(
            err.to_string(),
            "Insufficient data: need at least 30 samples, got 5"
        );
    }

    #[test]
    fn test_error_kinds_are_distinguishable() {
        assert_eq!(DeployError::NoCandidate.kind(), ErrorKind::NoCandidate);
        assert_eq!(DeployError::NotFitted.kind(), ErrorKind::NotFitted);
        assert_eq!(
            DeployError::model_unavailable("v2", "timeout").kind(),
            ErrorKind::ModelUnavailable
        );
        assert_eq!(
            DeployError::RetrainingInFlight { job_id: "a".into() }.kind(),
            ErrorKind::RetrainingInFlight
        );
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: DeployError = json_err.into();
        assert!(matches!(err, DeployError::SerializationError(_)));
    }
}
