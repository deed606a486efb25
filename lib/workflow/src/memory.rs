//! In-process implementations of the lifecycle's collaborators.
//!
//! Used by tests and by single-node deployments that do not need durability.

use crate::error::{EventError, GraphError, QueueError, RunStoreError};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::graph::{WorkflowGraph, WorkflowSource};
use crate::message::TriggerMessage;
use crate::queue::{DelayQueue, check_delay};
use crate::run::{RunStatus, WorkflowRun};
use crate::store::RunStore;
use amber_relay_core::{WorkflowId, WorkflowRunId, WorkspaceId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runs held in a map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<Mutex<HashMap<WorkflowRunId, WorkflowRun>>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &WorkflowRun) -> Result<(), RunStoreError> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::AlreadyExists { run_id: run.id });
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, run_id: WorkflowRunId) -> Result<Option<WorkflowRun>, RunStoreError> {
        Ok(self.runs.lock().unwrap().get(&run_id).cloned())
    }

    async fn update_if(
        &self,
        run: &WorkflowRun,
        expected: RunStatus,
    ) -> Result<WorkflowRun, RunStoreError> {
        let mut runs = self.runs.lock().unwrap();
        let stored = runs
            .get_mut(&run.id)
            .ok_or(RunStoreError::NotFound { run_id: run.id })?;
        if stored.status != expected || stored.revision != run.revision {
            return Err(RunStoreError::Conflict {
                run_id: run.id,
                expected,
                actual: stored.status,
            });
        }
        *stored = WorkflowRun {
            revision: run.revision + 1,
            ..run.clone()
        };
        Ok(stored.clone())
    }
}

/// A message accepted by [`InMemoryDelayQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: TriggerMessage,
    pub delay: Duration,
    pub dedup_key: String,
}

/// Records enqueued messages; drops duplicates by key.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDelayQueue {
    queued: Arc<Mutex<Vec<QueuedMessage>>>,
    seen: Arc<Mutex<HashSet<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDelayQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently queued, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.queued.lock().unwrap().clone()
    }

    /// Removes and returns every queued message.
    pub fn drain(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut *self.queued.lock().unwrap())
    }

    /// Makes every enqueue fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {
    async fn enqueue(
        &self,
        message: &TriggerMessage,
        delay: Duration,
        dedup_key: &str,
    ) -> Result<(), QueueError> {
        check_delay(delay)?;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::PublishFailed {
                message: "queue unavailable".to_string(),
            });
        }
        if !self.seen.lock().unwrap().insert(dedup_key.to_string()) {
            return Ok(());
        }
        self.queued.lock().unwrap().push(QueuedMessage {
            message: message.clone(),
            delay,
            dedup_key: dedup_key.to_string(),
        });
        Ok(())
    }
}

/// Graphs held in a map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowSource {
    graphs: Arc<Mutex<HashMap<(WorkspaceId, WorkflowId), WorkflowGraph>>>,
}

impl InMemoryWorkflowSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a graph.
    pub fn insert(&self, graph: WorkflowGraph) {
        self.graphs
            .lock()
            .unwrap()
            .insert((graph.workspace_id, graph.workflow_id), graph);
    }
}

#[async_trait]
impl WorkflowSource for InMemoryWorkflowSource {
    async fn load(
        &self,
        workflow_id: WorkflowId,
        workspace_id: WorkspaceId,
    ) -> Result<WorkflowGraph, GraphError> {
        self.graphs
            .lock()
            .unwrap()
            .get(&(workspace_id, workflow_id))
            .cloned()
            .ok_or(GraphError::WorkflowNotFound { workflow_id })
    }
}

/// Keeps every emitted event.
#[derive(Debug, Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingEvents {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleEvents for RecordingEvents {
    async fn emit(&self, event: LifecycleEvent) -> Result<(), EventError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
