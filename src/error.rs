//! Error types for Paracore
//!
//! This module defines all error types used throughout the crate, providing
//! enough detail for the caller to tell configuration problems apart from
//! submission and execution failures.

use crate::submit::{AttemptRecord, FailureCause};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Paracore operations
#[derive(Error, Debug)]
pub enum ParacoreError {
    /// I/O error while reading profiles, scripts or log files
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or missing configuration, unknown cluster, unresolved template tag
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The provider rejected a job specification
    #[error("Submission error: {0}")]
    SubmissionError(String),

    /// Pre-flight check found the requested partition unavailable
    #[error("Partition '{partition}' is not available: {message}")]
    PartitionValidationError { partition: String, message: String },

    /// A physical job ran and failed
    #[error("Job {job_id} failed: {message}")]
    TaskFailed { job_id: String, message: String },

    /// Waiting for a job result exceeded the caller's timeout
    #[error("Timed out waiting for job {job_id} after {waited:?}")]
    Timeout { job_id: String, waited: Duration },

    /// Every attempt of a logical task failed
    #[error("All {attempts} attempt(s) failed; last cause: {last_cause}")]
    RetryExhausted {
        attempts: u32,
        last_cause: FailureCause,
        history: Vec<AttemptRecord>,
    },

    /// The autotune pilot produced no usable samples
    #[error("Pilot produced no usable samples ({failed} of {submitted} failed){}", last_cause_suffix(.last_cause))]
    PilotMeasurementError {
        submitted: usize,
        failed: usize,
        last_cause: Option<String>,
    },

    /// A logical task was cancelled by the caller
    #[error("Task cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// The provider could not be queried
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Payload or artifact (de)serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A supervising task panicked or was aborted
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ParacoreError>,
    },
}

fn last_cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!("; last cause: {}", cause),
        None => String::new(),
    }
}

impl ParacoreError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a submission error
    pub fn submission(message: impl Into<String>) -> Self {
        Self::SubmissionError(message.into())
    }

    /// Create a provider error
    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderError(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers
    pub fn root(&self) -> &ParacoreError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is a configuration problem (never retried)
    pub fn is_config_error(&self) -> bool {
        matches!(
            self.root(),
            Self::ConfigError(_) | Self::PartitionValidationError { .. }
        )
    }

    /// Check if resubmitting could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::Io { .. }
                | Self::SubmissionError(_)
                | Self::TaskFailed { .. }
                | Self::ProviderError(_)
        )
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Self::ConfigError(_) | Self::PartitionValidationError { .. } => 2,
            Self::SubmissionError(_)
            | Self::TaskFailed { .. }
            | Self::Timeout { .. }
            | Self::RetryExhausted { .. }
            | Self::Cancelled { .. }
            | Self::ProviderError(_) => 3,
            Self::PilotMeasurementError { .. } => 4,
            _ => 1,
        }
    }

    /// Attempt count carried by terminal errors, if any
    pub fn attempts(&self) -> Option<u32> {
        match self.root() {
            Self::RetryExhausted { attempts, .. } | Self::Cancelled { attempts } => Some(*attempts),
            _ => None,
        }
    }
}

/// Result type alias for Paracore operations
pub type Result<T> = std::result::Result<T, ParacoreError>;

impl From<std::io::Error> for ParacoreError {
    fn from(err: std::io::Error) -> Self {
        ParacoreError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for ParacoreError {
    fn from(err: serde_json::Error) -> Self {
        ParacoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ParacoreError {
    fn from(err: serde_yaml::Error) -> Self {
        ParacoreError::ConfigError(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| ParacoreError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_separate_config_from_submission() {
        assert_eq!(ParacoreError::config("bad").exit_code(), 2);
        assert_eq!(ParacoreError::submission("rejected").exit_code(), 3);
        assert_eq!(
            ParacoreError::RetryExhausted {
                attempts: 3,
                last_cause: FailureCause::Submission("boom".into()),
                history: Vec::new(),
            }
            .exit_code(),
            3
        );
        let pilot = ParacoreError::PilotMeasurementError {
            submitted: 4,
            failed: 4,
            last_cause: None,
        };
        assert_eq!(pilot.exit_code(), 4);
    }

    #[test]
    fn test_context_preserves_classification() {
        let err = ParacoreError::config("unknown cluster").with_context("resolving profile");
        assert!(err.is_config_error());
        assert!(!err.is_recoverable());
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().starts_with("resolving profile"));
    }

    #[test]
    fn test_recoverability() {
        assert!(ParacoreError::submission("invalid partition").is_recoverable());
        let timeout = ParacoreError::Timeout {
            job_id: "12".into(),
            waited: Duration::from_secs(5),
        };
        assert!(!timeout.is_recoverable());
        assert_eq!(ParacoreError::Cancelled { attempts: 2 }.attempts(), Some(2));
    }

    #[test]
    fn test_pilot_message_includes_cause() {
        let err = ParacoreError::PilotMeasurementError {
            submitted: 2,
            failed: 2,
            last_cause: Some("exit 1".into()),
        };
        assert_eq!(
            err.to_string(),
            "Pilot produced no usable samples (2 of 2 failed); last cause: exit 1"
        );
    }
}
