//! Terminal lifecycle events for external subscribers.

use crate::error::EventError;
use crate::run::{RunStatus, WorkflowRun};
use amber_relay_core::{WorkflowId, WorkflowRunId, WorkspaceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted once when a run reaches `completed` or `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub run_id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// The terminal event for `run`.
    #[must_use]
    pub fn terminal(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id,
            workflow_id: run.workflow_id,
            workspace_id: run.workspace_id,
            status: run.status,
            error: run.error.clone(),
            occurred_at: run.completed_at.unwrap_or(run.updated_at),
        }
    }
}

/// Publishes lifecycle events.
#[async_trait]
pub trait LifecycleEvents: Send + Sync {
    /// Publishes one event.
    async fn emit(&self, event: LifecycleEvent) -> Result<(), EventError>;
}
