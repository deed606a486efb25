//! Workflow run records.

use crate::message::TriggerMessage;
use amber_relay_core::{ContactId, WorkflowId, WorkflowRunId, WorkspaceId};
use amber_relay_dispatch::NodeResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Status of a workflow run.
///
/// `running → waiting → running → … → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns true for `completed` and `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a workflow for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub contact_id: Option<ContactId>,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_data: Map<String, JsonValue>,
    pub status: RunStatus,
    /// Variables accumulated by executed nodes. Node outputs are stored
    /// under the producing node's id.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Next node to execute. Checkpointed after every node, so a drive that
    /// dies part way can be picked up where it stopped.
    pub current_node_id: Option<String>,
    pub wake_at: Option<DateTime<Utc>>,
    /// Key of the wake-up this run last waited on. Only a resume message
    /// carrying the same key may move the run on.
    #[serde(default)]
    pub wake_key: Option<String>,
    /// Bumped by the store on every update.
    #[serde(default)]
    pub revision: u64,
    /// Nodes executed over the run's lifetime.
    pub step_count: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a running run from a start message.
    #[must_use]
    pub fn start(message: &TriggerMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: message.workflow_run_id.unwrap_or_default(),
            workflow_id: message.workflow_id,
            workspace_id: message.workspace_id,
            contact_id: message.contact_id,
            trigger_type: message.trigger_type.clone(),
            trigger_data: message.trigger_data.clone(),
            status: RunStatus::Running,
            variables: message.variables.clone(),
            current_node_id: message.next_node_id.clone(),
            wake_at: None,
            wake_key: None,
            revision: 0,
            step_count: 0,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Folds a node's result into the run's variables.
    pub fn merge_result(&mut self, node_id: &str, result: &NodeResult) {
        self.variables
            .extend(result.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !result.output.is_empty() {
            self.variables
                .insert(node_id.to_string(), JsonValue::Object(result.output.clone()));
        }
    }

    /// Pauses the run until `wake_at`, resuming at `next_node_id` when the
    /// wake-up identified by `wake_key` arrives.
    pub fn wait(
        &mut self,
        next_node_id: Option<String>,
        wake_at: DateTime<Utc>,
        wake_key: String,
        now: DateTime<Utc>,
    ) {
        self.status = RunStatus::Waiting;
        self.current_node_id = next_node_id;
        self.wake_at = Some(wake_at);
        self.wake_key = Some(wake_key);
        self.updated_at = now;
    }

    /// Returns a waiting run to running. The wake key is kept so a
    /// redelivered copy of the same wake-up can pick the drive back up.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.wake_at = None;
        self.updated_at = now;
    }

    /// Moves the cursor to `next_node_id`.
    pub fn advance(&mut self, next_node_id: Option<String>, now: DateTime<Utc>) {
        self.current_node_id = next_node_id;
        self.updated_at = now;
    }

    /// Returns true if `wake_key` names the wake-up this run waits on.
    #[must_use]
    pub fn is_woken_by(&self, wake_key: Option<&str>) -> bool {
        matches!((self.wake_key.as_deref(), wake_key), (Some(ours), Some(theirs)) if ours == theirs)
    }

    /// Marks the run completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Completed;
        self.current_node_id = None;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Marks the run failed.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Key for a wake-up at `wake_at` scheduled from the current step.
    ///
    /// Re-executing the same wait later yields a new key, which retires
    /// any wake-up left over from the earlier attempt.
    #[must_use]
    pub fn next_wake_key(&self, wake_at: DateTime<Utc>) -> String {
        format!("{}:{}:{}", self.id, self.step_count, wake_at.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn run() -> WorkflowRun {
        let message = TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_tag_added");
        WorkflowRun::start(&message, Utc::now())
    }

    #[test]
    fn start_is_running() {
        let run = run();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.step_count, 0);
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn start_keeps_preassigned_run_id() {
        let run_id = WorkflowRunId::new();
        let mut message = TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_webhook");
        message.workflow_run_id = Some(run_id);
        assert_eq!(WorkflowRun::start(&message, Utc::now()).id, run_id);
    }

    #[test]
    fn merge_result_stores_output_under_node_id() {
        let mut run = run();
        let mut variables = Map::new();
        variables.insert("score".to_string(), json!(7));
        let result = NodeResult::completed()
            .with_variables(variables)
            .with_output_value("message_id", json!("m-1"));

        run.merge_result("send", &result);

        assert_eq!(run.variables["score"], 7);
        assert_eq!(run.variables["send"]["message_id"], "m-1");
    }

    #[test]
    fn wait_and_resume() {
        let mut run = run();
        let now = Utc::now();
        run.wait(Some("after".to_string()), now + Duration::hours(2), "k1".to_string(), now);
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(run.current_node_id.as_deref(), Some("after"));
        assert!(run.is_woken_by(Some("k1")));
        assert!(!run.is_woken_by(Some("k0")));
        assert!(!run.is_woken_by(None));

        run.resume(now);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.wake_at.is_none());
        assert!(run.is_woken_by(Some("k1")));
    }

    #[test]
    fn fresh_run_is_woken_by_nothing() {
        assert!(!run().is_woken_by(None));
        assert!(!run().is_woken_by(Some("k")));
    }

    #[test]
    fn terminal_states() {
        let mut run = run();
        run.fail("boom", Utc::now());
        assert!(run.status.is_terminal());
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(!RunStatus::Waiting.is_terminal());
    }

    #[test]
    fn wake_key_includes_step_and_time() {
        let mut run = run();
        run.step_count = 3;
        let at = Utc::now();
        assert_eq!(
            run.next_wake_key(at),
            format!("{}:3:{}", run.id, at.timestamp_millis())
        );
        assert_ne!(run.next_wake_key(at), run.next_wake_key(at + Duration::seconds(1)));
    }

    #[test]
    fn start_points_cursor_at_requested_node() {
        let mut message =
            TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_webhook");
        message.next_node_id = Some("send".to_string());
        let run = WorkflowRun::start(&message, Utc::now());
        assert_eq!(run.current_node_id.as_deref(), Some("send"));
        assert_eq!(run.revision, 0);
    }
}
