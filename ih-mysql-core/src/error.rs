//! Error type for replica-set bootstrap
//!
//! Every fatal condition of a bootstrap run surfaces as a [`BootstrapError`].
//! Expected "not found" outcomes (no master yet, no secret, no backup bucket
//! tag) are modelled as `Option` returns by the collaborator traits and never
//! reach this type.

use std::time::Duration;
use thiserror::Error;

/// Fatal error raised while bootstrapping or managing a MySQL node
#[derive(Error, Debug)]
pub enum BootstrapError {
    // Coordination
    #[error("Failed to acquire lock '{name}': {reason}")]
    LockNotAcquired { name: String, reason: String },

    #[error("Lost lock '{name}': {reason}")]
    LockLost { name: String, reason: String },

    #[error("Failed to get master IP for instance {instance_id}")]
    MasterUnresolvable { instance_id: String },

    // Credentials
    #[error("Credentials error: {message}")]
    Credentials { message: String },

    // Remote execution
    #[error("{operation} failed: {stderr}")]
    CommandFailed { operation: String, stderr: String },

    #[error("Replication error: {message}")]
    Replication { message: String },

    // Collaborators
    #[error("AWS call '{operation}' failed{}: {message}", format_code(.code))]
    Aws {
        operation: String,
        code: Option<String>,
        message: String,
    },

    #[error("Instance metadata error: {0}")]
    Metadata(#[from] reqwest::Error),

    // Configuration
    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    // Operational
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_code(code: &Option<String>) -> String {
    match code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

pub type BootstrapResult<T> = std::result::Result<T, BootstrapError>;

impl BootstrapError {
    /// Remote command exited non-zero
    pub fn command_failed(operation: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            operation: operation.into(),
            stderr: stderr.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn credentials(message: impl Into<String>) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn replication(message: impl Into<String>) -> Self {
        Self::Replication {
            message: message.into(),
        }
    }

    /// AWS error code carried by this error, if any
    pub fn aws_code(&self) -> Option<&str> {
        match self {
            Self::Aws { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_error_display_includes_code() {
        let err = BootstrapError::Aws {
            operation: "dynamodb get-item".to_string(),
            code: Some("ResourceNotFoundException".to_string()),
            message: "Requested resource not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "AWS call 'dynamodb get-item' failed (ResourceNotFoundException): Requested resource not found"
        );
        assert_eq!(err.aws_code(), Some("ResourceNotFoundException"));
    }

    #[test]
    fn test_command_failed_carries_stderr() {
        let err = BootstrapError::command_failed("SQL execution", "ERROR 1045 (28000): Access denied");
        assert_eq!(
            err.to_string(),
            "SQL execution failed: ERROR 1045 (28000): Access denied"
        );
        assert_eq!(err.aws_code(), None);
    }
}
