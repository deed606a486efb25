//! Workflow run lifecycle.
//!
//! Drives a run node by node through the dispatcher, checkpointing the
//! cursor after every node. Runs pause on wait nodes and come back through
//! either the delay queue (short waits) or the wake scheduler (long waits).
//! Each wait gets its own key and only a resume message carrying the run's
//! current key moves it on. The terminal transition is a conditional update
//! from `running`, and the lifecycle event is emitted only when that update
//! wins, so each run reports its outcome once.

use crate::error::{LifecycleError, RunStoreError};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::graph::{GraphNode, WorkflowGraph, WorkflowSource};
use crate::message::{MessageAction, TriggerMessage};
use crate::queue::{DelayQueue, MAX_QUEUE_DELAY, WakeScheduler};
use crate::run::{RunStatus, WorkflowRun};
use crate::store::RunStore;
use amber_relay_core::{Clock, SystemClock, WorkflowRunId};
use amber_relay_dispatch::{ExecutionContext, NodeDispatcher, NodeExecutionRequest, NodeResult};
use chrono::{DateTime, Utc};
use rootcause::prelude::Report;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default cap on nodes executed in one drive.
pub const DEFAULT_MAX_STEPS: u32 = 500;

/// Lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Nodes executed per drive before the run is failed as cyclic.
    pub max_steps: u32,
    /// Waits up to this long use the delay queue.
    pub max_queue_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_queue_delay: MAX_QUEUE_DELAY,
        }
    }
}

/// How a waiting run will be woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeRoute {
    DelayQueue,
    Scheduler,
}

/// A node that failed its run, with what is needed to dead-letter it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub node_id: String,
    pub node_type: String,
    pub error: String,
    pub error_code: Option<String>,
    pub provider: Option<String>,
    /// Starts a new run at the failed node with the failed run's context.
    pub restart: TriggerMessage,
}

/// Where a drive left the run.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    Completed,
    Failed {
        error: String,
        /// Present when a node failed, absent for graph faults such as a
        /// missing node or the step limit.
        failure: Option<NodeFailure>,
    },
    Waiting { wake_at: DateTime<Utc>, route: WakeRoute },
    /// Another worker moved the run on first.
    Superseded,
    /// A start message for a run that already exists and is not
    /// recoverable from this message.
    AlreadyStarted { status: RunStatus },
}

/// Result of handling a resume message.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Resumed(DriveOutcome),
    /// The message's wake key is not the run's current one, or the run has
    /// ended; nothing was done.
    Skipped { status: RunStatus },
}

/// Result of handling any lifecycle message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    Started {
        run_id: WorkflowRunId,
        outcome: DriveOutcome,
    },
    Resumed(ResumeOutcome),
}

impl HandleOutcome {
    /// The drive outcome, when a drive happened.
    #[must_use]
    pub fn drive(&self) -> Option<&DriveOutcome> {
        match self {
            Self::Started { outcome, .. } | Self::Resumed(ResumeOutcome::Resumed(outcome)) => {
                Some(outcome)
            }
            Self::Resumed(ResumeOutcome::Skipped { .. }) => None,
        }
    }
}

/// Owns workflow runs from trigger to terminal state.
pub struct RunLifecycle {
    dispatcher: Arc<NodeDispatcher>,
    graphs: Arc<dyn WorkflowSource>,
    runs: Arc<dyn RunStore>,
    queue: Arc<dyn DelayQueue>,
    scheduler: Arc<dyn WakeScheduler>,
    events: Arc<dyn LifecycleEvents>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl RunLifecycle {
    /// Creates a lifecycle on the system clock with default settings.
    #[must_use]
    pub fn new(
        dispatcher: Arc<NodeDispatcher>,
        graphs: Arc<dyn WorkflowSource>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn DelayQueue>,
        scheduler: Arc<dyn WakeScheduler>,
        events: Arc<dyn LifecycleEvents>,
    ) -> Self {
        Self {
            dispatcher,
            graphs,
            runs,
            queue,
            scheduler,
            events,
            clock: Arc::new(SystemClock),
            config: LifecycleConfig::default(),
        }
    }

    /// Uses `clock` for timestamps and wake times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the settings.
    #[must_use]
    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Handles a start or resume message.
    ///
    /// # Errors
    ///
    /// Returns an error if a collaborator fails; see [`RunLifecycle::start`]
    /// and [`RunLifecycle::resume`].
    pub async fn handle(&self, message: &TriggerMessage) -> Result<HandleOutcome, Report<LifecycleError>> {
        match message.action {
            MessageAction::Start => {
                let (run_id, outcome) = self.start(message).await?;
                Ok(HandleOutcome::Started { run_id, outcome })
            }
            MessageAction::Resume => Ok(HandleOutcome::Resumed(self.resume(message).await?)),
        }
    }

    /// Creates a run for a trigger and drives it until it waits or ends.
    ///
    /// Starting is idempotent on `workflow_run_id`. When the run already
    /// exists and its first drive never reached a wait, the drive is picked
    /// up from the last checkpoint; otherwise nothing is done.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be loaded or a store, queue or
    /// scheduler call fails. The run is left at its last checkpoint, so
    /// handling the same message again continues from there.
    #[instrument(
        skip(self, message),
        fields(workflow_id = %message.workflow_id, workspace_id = %message.workspace_id)
    )]
    pub async fn start(
        &self,
        message: &TriggerMessage,
    ) -> Result<(WorkflowRunId, DriveOutcome), Report<LifecycleError>> {
        let graph = self
            .graphs
            .load(message.workflow_id, message.workspace_id)
            .await
            .map_err(LifecycleError::from)?;

        let mut run = WorkflowRun::start(message, self.clock.now());
        if run.current_node_id.is_none() {
            run.current_node_id = Some(graph.entry_node_id.clone());
        }
        let run_id = run.id;

        match self.runs.create(&run).await {
            Ok(()) => {
                info!(%run_id, trigger_type = %run.trigger_type, "run started");
            }
            Err(RunStoreError::AlreadyExists { .. }) => {
                let existing = self
                    .runs
                    .get(run_id)
                    .await
                    .map_err(LifecycleError::from)?
                    .ok_or(LifecycleError::Store(RunStoreError::NotFound { run_id }))?;
                if existing.status != RunStatus::Running || existing.wake_key.is_some() {
                    debug!(%run_id, status = %existing.status, "run already started, skipping");
                    return Ok((run_id, DriveOutcome::AlreadyStarted { status: existing.status }));
                }
                info!(%run_id, next_node_id = ?existing.current_node_id, "picking up interrupted run");
                run = existing;
            }
            Err(e) => return Err(LifecycleError::from(e).into()),
        }

        let outcome = self.drive(run, &graph).await?;
        Ok((run_id, outcome))
    }

    /// Resumes a waiting run.
    ///
    /// Only a message carrying the run's current wake key is acted on, so
    /// stale and duplicate wake-ups are harmless. The run continues from its
    /// stored cursor. A run already `running` under the same key lost its
    /// drive part way, and is picked up from the last checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the message has no run id, the run does not
    /// exist, or a collaborator fails.
    #[instrument(skip(self, message), fields(run_id = ?message.workflow_run_id, wake_key = ?message.wake_key))]
    pub async fn resume(&self, message: &TriggerMessage) -> Result<ResumeOutcome, Report<LifecycleError>> {
        let run_id = message
            .workflow_run_id
            .ok_or_else(|| LifecycleError::InvalidMessage {
                reason: "resume message has no workflow_run_id".to_string(),
            })?;

        let mut run = self
            .runs
            .get(run_id)
            .await
            .map_err(LifecycleError::from)?
            .ok_or(LifecycleError::Store(RunStoreError::NotFound { run_id }))?;

        if run.status.is_terminal() || !run.is_woken_by(message.wake_key.as_deref()) {
            debug!(status = %run.status, current_key = ?run.wake_key, "stale wake-up, skipping");
            return Ok(ResumeOutcome::Skipped { status: run.status });
        }

        if run.status == RunStatus::Waiting {
            run.resume(self.clock.now());
            run = match self.runs.update_if(&run, RunStatus::Waiting).await {
                Ok(stored) => stored,
                Err(RunStoreError::Conflict { actual, .. }) => {
                    debug!(status = %actual, "run resumed elsewhere, skipping");
                    return Ok(ResumeOutcome::Skipped { status: actual });
                }
                Err(e) => return Err(LifecycleError::from(e).into()),
            };
            info!(next_node_id = ?run.current_node_id, "run resumed");
        } else {
            info!(next_node_id = ?run.current_node_id, "picking up interrupted resume");
        }

        let graph = self
            .graphs
            .load(run.workflow_id, run.workspace_id)
            .await
            .map_err(LifecycleError::from)?;
        let outcome = self.drive(run, &graph).await?;
        Ok(ResumeOutcome::Resumed(outcome))
    }

    async fn drive(
        &self,
        mut run: WorkflowRun,
        graph: &WorkflowGraph,
    ) -> Result<DriveOutcome, Report<LifecycleError>> {
        let mut steps = 0u32;

        loop {
            let Some(node_id) = run.current_node_id.clone() else {
                return self.finish(run, None).await;
            };
            if steps >= self.config.max_steps {
                let error = format!("step limit of {} exceeded", self.config.max_steps);
                return self.finish(run, Some((error, None))).await;
            }
            let Some(node) = graph.node(&node_id) else {
                return self
                    .finish(run, Some((format!("node not found: {node_id}"), None)))
                    .await;
            };

            steps += 1;
            run.step_count += 1;

            let request = NodeExecutionRequest::new(&node.node_type, &node.id, run.workspace_id)
                .with_config(node.config.clone())
                .with_context(ExecutionContext {
                    trigger_data: run.trigger_data.clone(),
                    variables: run.variables.clone(),
                    contact_id: run.contact_id,
                });
            let dispatched = self.dispatcher.dispatch(&request, None).await;
            let result = dispatched.node_result;
            debug!(
                node_id = %node.id,
                node_type = %node.node_type,
                success = result.success,
                status = ?result.status,
                retry_attempts = dispatched.retry_attempts,
                "node executed"
            );

            if !result.success {
                let failure = node_failure(&run, node, &result);
                run.merge_result(&node.id, &result);
                return self.finish(run, Some((failure.error.clone(), Some(failure)))).await;
            }
            run.merge_result(&node.id, &result);

            let successor = result
                .next_node_id
                .clone()
                .or_else(|| graph.successor(&node.id).map(str::to_string));

            if result.is_waiting() {
                let seconds = result.wait_seconds.unwrap_or(0);
                return self.suspend(run, successor, seconds).await;
            }

            run.advance(successor, self.clock.now());
            if run.current_node_id.is_some() {
                run = match self.runs.update_if(&run, RunStatus::Running).await {
                    Ok(stored) => stored,
                    Err(RunStoreError::Conflict { actual, .. }) => {
                        warn!(run_id = %run.id, status = %actual, "run moved on elsewhere, stopping");
                        return Ok(DriveOutcome::Superseded);
                    }
                    Err(e) => return Err(LifecycleError::from(e).into()),
                };
            }
        }
    }

    // The wake-up is published before the run is marked waiting. If the
    // publish fails the run stays `running` at the wait node; if the commit
    // fails the published wake-up carries a key the run never stored and is
    // skipped on arrival.
    async fn suspend(
        &self,
        mut run: WorkflowRun,
        next: Option<String>,
        wait_seconds: u64,
    ) -> Result<DriveOutcome, Report<LifecycleError>> {
        let now = self.clock.now();
        let wait = Duration::from_secs(wait_seconds);
        let Some(wake_at) = i64::try_from(wait_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|delta| now.checked_add_signed(delta))
        else {
            let error = format!("wait of {wait_seconds}s is out of range");
            return self.finish(run, Some((error, None))).await;
        };

        let key = run.next_wake_key(wake_at);
        run.wait(next, wake_at, key.clone(), now);
        let message = TriggerMessage::resume(&run, key.clone());

        let route = if wait <= self.config.max_queue_delay {
            self.queue
                .enqueue(&message, wait, &key)
                .await
                .map_err(LifecycleError::from)?;
            WakeRoute::DelayQueue
        } else {
            self.scheduler
                .schedule_once(&key, wake_at, &message)
                .await
                .map_err(LifecycleError::from)?;
            WakeRoute::Scheduler
        };

        match self.runs.update_if(&run, RunStatus::Running).await {
            Ok(_) => {}
            Err(RunStoreError::Conflict { actual, .. }) => {
                warn!(run_id = %run.id, status = %actual, "run moved on elsewhere, dropping wake-up");
                if route == WakeRoute::Scheduler {
                    if let Err(e) = self.scheduler.cancel(&key).await {
                        warn!(run_id = %run.id, error = %e, "failed to cancel orphaned wake-up");
                    }
                }
                return Ok(DriveOutcome::Superseded);
            }
            Err(e) => return Err(LifecycleError::from(e).into()),
        }

        info!(run_id = %run.id, wait_seconds, ?route, %wake_at, "run waiting");
        Ok(DriveOutcome::Waiting { wake_at, route })
    }

    async fn finish(
        &self,
        mut run: WorkflowRun,
        failed: Option<(String, Option<NodeFailure>)>,
    ) -> Result<DriveOutcome, Report<LifecycleError>> {
        let now = self.clock.now();
        let outcome = match failed {
            Some((error, failure)) => {
                run.fail(error.clone(), now);
                DriveOutcome::Failed { error, failure }
            }
            None => {
                run.complete(now);
                DriveOutcome::Completed
            }
        };

        let run = match self.runs.update_if(&run, RunStatus::Running).await {
            Ok(stored) => stored,
            Err(RunStoreError::Conflict { actual, .. }) => {
                warn!(run_id = %run.id, status = %actual, "run already left running, not finishing");
                return Ok(DriveOutcome::Superseded);
            }
            Err(e) => return Err(LifecycleError::from(e).into()),
        };

        info!(run_id = %run.id, status = %run.status, error = ?run.error, "run finished");
        if let Err(e) = self.events.emit(LifecycleEvent::terminal(&run)).await {
            warn!(run_id = %run.id, error = %e, "failed to emit lifecycle event");
        }
        Ok(outcome)
    }
}

fn node_failure(run: &WorkflowRun, node: &GraphNode, result: &NodeResult) -> NodeFailure {
    NodeFailure {
        node_id: node.id.clone(),
        node_type: node.node_type.clone(),
        error: result
            .error
            .clone()
            .unwrap_or_else(|| format!("node {} failed", node.id)),
        error_code: result.error_code.clone(),
        provider: result.provider.clone(),
        restart: TriggerMessage::restart_at(run, node.id.clone()),
    }
}
