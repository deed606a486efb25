//! Run persistence.

use crate::error::RunStoreError;
use crate::run::{RunStatus, WorkflowRun};
use amber_relay_core::WorkflowRunId;
use async_trait::async_trait;

/// Keyed store of workflow runs.
///
/// Every transition goes through [`RunStore::update_if`], so concurrent
/// workers racing on one run cannot both apply a transition.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run.
    async fn create(&self, run: &WorkflowRun) -> Result<(), RunStoreError>;

    /// Loads a run.
    async fn get(&self, run_id: WorkflowRunId) -> Result<Option<WorkflowRun>, RunStoreError>;

    /// Replaces the stored run only if its status is still `expected` and
    /// its revision still matches `run.revision`.
    ///
    /// Returns the stored copy, whose revision is one higher. Returns
    /// [`RunStoreError::Conflict`] when either check fails.
    async fn update_if(
        &self,
        run: &WorkflowRun,
        expected: RunStatus,
    ) -> Result<WorkflowRun, RunStoreError>;
}
