//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`, `RunStoreError`, `QueueError`, `ScheduleError`, `EventError`:
//!   raised by the collaborators behind the lifecycle's seam traits
//! - `NatsError`: transport setup failures
//! - `LifecycleError`: a trigger or resume message could not be processed
//!
//! Node failures are not errors here. They end the run as `failed`.

use crate::run::RunStatus;
use amber_relay_core::{WorkflowId, WorkflowRunId};
use std::fmt;

/// Errors from loading workflow graphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// No graph exists for the workflow.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The backing store failed.
    LoadFailed { message: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::LoadFailed { message } => write!(f, "failed to load workflow graph: {message}"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from the run store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    /// A run with this id already exists.
    AlreadyExists { run_id: WorkflowRunId },
    /// The run does not exist.
    NotFound { run_id: WorkflowRunId },
    /// The stored status did not match the expected status.
    Conflict {
        run_id: WorkflowRunId,
        expected: RunStatus,
        actual: RunStatus,
    },
    /// The backing store failed.
    StorageFailed { message: String },
}

impl fmt::Display for RunStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists { run_id } => write!(f, "run already exists: {run_id}"),
            Self::NotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::Conflict {
                run_id,
                expected,
                actual,
            } => write!(
                f,
                "run {run_id} is {actual}, expected {expected}"
            ),
            Self::StorageFailed { message } => write!(f, "run store failed: {message}"),
        }
    }
}

impl std::error::Error for RunStoreError {}

/// Errors from the delay queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The delay exceeds what the queue can hold.
    DelayTooLong { seconds: u64, max_seconds: u64 },
    /// Serializing the message failed.
    SerializeFailed { message: String },
    /// Publishing failed.
    PublishFailed { message: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DelayTooLong {
                seconds,
                max_seconds,
            } => write!(f, "delay of {seconds}s exceeds queue maximum of {max_seconds}s"),
            Self::SerializeFailed { message } => write!(f, "failed to serialize message: {message}"),
            Self::PublishFailed { message } => write!(f, "failed to publish message: {message}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors from the wake scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The fire time is not in the future.
    FireTimeInPast { key: String },
    /// The scheduler backend failed.
    ScheduleFailed { message: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FireTimeInPast { key } => write!(f, "fire time for '{key}' is in the past"),
            Self::ScheduleFailed { message } => write!(f, "failed to schedule wake-up: {message}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors from lifecycle event publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Publishing failed.
    PublishFailed { message: String },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublishFailed { message } => write!(f, "failed to publish lifecycle event: {message}"),
        }
    }
}

impl std::error::Error for EventError {}

/// Errors from setting up the NATS transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatsError {
    /// Connecting to the server failed.
    ConnectionFailed { url: String, message: String },
    /// Creating or loading a stream failed.
    StreamSetupFailed { stream: String, message: String },
}

impl fmt::Display for NatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { url, message } => {
                write!(f, "failed to connect to {url}: {message}")
            }
            Self::StreamSetupFailed { stream, message } => {
                write!(f, "failed to set up stream {stream}: {message}")
            }
        }
    }
}

impl std::error::Error for NatsError {}

/// Errors from processing a trigger or resume message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The message is missing data required for its action.
    InvalidMessage { reason: String },
    /// The workflow graph could not be loaded.
    Graph(GraphError),
    /// The run store failed.
    Store(RunStoreError),
    /// The short-wait re-enqueue failed.
    Queue(QueueError),
    /// The long-wait schedule failed.
    Schedule(ScheduleError),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMessage { reason } => write!(f, "invalid lifecycle message: {reason}"),
            Self::Graph(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Queue(e) => write!(f, "{e}"),
            Self::Schedule(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<GraphError> for LifecycleError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

impl From<RunStoreError> for LifecycleError {
    fn from(e: RunStoreError) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for LifecycleError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<ScheduleError> for LifecycleError {
    fn from(e: ScheduleError) -> Self {
        Self::Schedule(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_both_states() {
        let err = RunStoreError::Conflict {
            run_id: WorkflowRunId::new(),
            expected: RunStatus::Waiting,
            actual: RunStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("is running"));
        assert!(msg.contains("expected waiting"));
    }

    #[test]
    fn queue_delay_display() {
        let err = QueueError::DelayTooLong {
            seconds: 1_000,
            max_seconds: 900,
        };
        assert_eq!(err.to_string(), "delay of 1000s exceeds queue maximum of 900s");
    }

    #[test]
    fn lifecycle_error_wraps_store_error() {
        let run_id = WorkflowRunId::new();
        let err = LifecycleError::from(RunStoreError::NotFound { run_id });
        assert_eq!(err.to_string(), format!("run not found: {run_id}"));
    }
}
