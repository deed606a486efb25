//! Error types for the dispatch crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `NodeExecutionError`: Faults raised by a node executor
//! - `RegistryError`: Executor registration problems
//!
//! The dispatcher itself never returns an error; executor faults are folded
//! into a failed `NodeResult` before they reach the caller.

use crate::retry::{RetryableKind, Retryable, classify_error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Faults raised while executing a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeExecutionError {
    /// Input or configuration was rejected.
    InvalidInput { message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// No executor is registered for the node type.
    UnsupportedNodeType { node_type: String },
    /// A downstream service reported an error.
    ExternalService { service: String, message: String },
    /// A messaging provider rejected the call with its own error code.
    Provider {
        provider: String,
        code: Option<String>,
        message: String,
    },
    /// The attempt exceeded its time budget.
    Timeout { seconds: u64 },
}

impl fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::UnsupportedNodeType { node_type } => {
                write!(f, "unsupported node type: {node_type}")
            }
            Self::ExternalService { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::Provider {
                provider,
                code: Some(code),
                message,
            } => write!(f, "{provider} error {code}: {message}"),
            Self::Provider {
                provider, message, ..
            } => write!(f, "{provider} error: {message}"),
            Self::Timeout { seconds } => write!(f, "execution timed out after {seconds}s"),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

impl Retryable for NodeExecutionError {
    fn retryable_kind(&self) -> RetryableKind {
        match self {
            Self::Timeout { .. } => RetryableKind::Transient,
            Self::InvalidInput { .. } | Self::UnsupportedNodeType { .. } => {
                RetryableKind::Permanent
            }
            Self::ExecutionFailed { message }
            | Self::ExternalService { message, .. }
            | Self::Provider { message, .. } => classify_error(message),
        }
    }
}

/// Errors from building the executor registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An executor is already registered for the node type.
    DuplicateExecutor { node_type: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateExecutor { node_type } => {
                write!(f, "executor already registered for node type '{node_type}'")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_display() {
        let err = NodeExecutionError::ExternalService {
            service: "ses".to_string(),
            message: "Throttling".to_string(),
        };
        assert_eq!(err.to_string(), "external service error (ses): Throttling");
    }

    #[test]
    fn timeouts_are_transient() {
        let err = NodeExecutionError::Timeout { seconds: 30 };
        assert_eq!(err.retryable_kind(), RetryableKind::Transient);
    }

    #[test]
    fn invalid_input_is_permanent() {
        let err = NodeExecutionError::InvalidInput {
            message: "connection reset".to_string(),
        };
        assert_eq!(err.retryable_kind(), RetryableKind::Permanent);
    }

    #[test]
    fn service_errors_classify_by_message() {
        let transient = NodeExecutionError::ExternalService {
            service: "twilio".to_string(),
            message: "Too Many Requests".to_string(),
        };
        let permanent = NodeExecutionError::ExternalService {
            service: "twilio".to_string(),
            message: "invalid recipient".to_string(),
        };
        assert_eq!(transient.retryable_kind(), RetryableKind::Transient);
        assert_eq!(permanent.retryable_kind(), RetryableKind::Permanent);
    }

    #[test]
    fn provider_errors_show_their_code() {
        let err = NodeExecutionError::Provider {
            provider: "ses".to_string(),
            code: Some("MessageRejected".to_string()),
            message: "invalid recipient address".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ses error MessageRejected: invalid recipient address"
        );
        assert_eq!(err.retryable_kind(), RetryableKind::Permanent);
    }

    #[test]
    fn registry_error_display() {
        let err = RegistryError::DuplicateExecutor {
            node_type: "logic_branch".to_string(),
        };
        assert!(err.to_string().contains("logic_branch"));
    }
}
