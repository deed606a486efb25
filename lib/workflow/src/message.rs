//! Trigger and resume messages consumed by the run lifecycle.

use crate::run::WorkflowRun;
use amber_relay_core::{ContactId, WorkflowId, WorkflowRunId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// What a message asks the lifecycle to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAction {
    #[default]
    Start,
    Resume,
}

/// A trigger or resume message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    #[serde(default)]
    pub workflow_run_id: Option<WorkflowRunId>,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub contact_id: Option<ContactId>,
    #[serde(default)]
    pub next_node_id: Option<String>,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_data: Map<String, JsonValue>,
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    #[serde(default)]
    pub action: MessageAction,
    /// Identifies the wake-up that produced a resume message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_key: Option<String>,
}

impl TriggerMessage {
    /// A start message with empty payload.
    #[must_use]
    pub fn start(
        workflow_id: WorkflowId,
        workspace_id: WorkspaceId,
        trigger_type: impl Into<String>,
    ) -> Self {
        Self {
            workflow_run_id: None,
            workflow_id,
            workspace_id,
            contact_id: None,
            next_node_id: None,
            trigger_type: trigger_type.into(),
            trigger_data: Map::new(),
            variables: Map::new(),
            action: MessageAction::Start,
            wake_key: None,
        }
    }

    /// The resume message for a waiting run.
    #[must_use]
    pub fn resume(run: &WorkflowRun, wake_key: impl Into<String>) -> Self {
        Self {
            workflow_run_id: Some(run.id),
            workflow_id: run.workflow_id,
            workspace_id: run.workspace_id,
            contact_id: run.contact_id,
            next_node_id: run.current_node_id.clone(),
            trigger_type: run.trigger_type.clone(),
            trigger_data: run.trigger_data.clone(),
            variables: run.variables.clone(),
            action: MessageAction::Resume,
            wake_key: Some(wake_key.into()),
        }
    }

    /// A start message for a new run that picks up `run` at `node_id`,
    /// carrying its trigger and the variables gathered so far.
    #[must_use]
    pub fn restart_at(run: &WorkflowRun, node_id: impl Into<String>) -> Self {
        Self {
            workflow_run_id: None,
            workflow_id: run.workflow_id,
            workspace_id: run.workspace_id,
            contact_id: run.contact_id,
            next_node_id: Some(node_id.into()),
            trigger_type: run.trigger_type.clone(),
            trigger_data: run.trigger_data.clone(),
            variables: run.variables.clone(),
            action: MessageAction::Start,
            wake_key: None,
        }
    }

    /// Sets the trigger payload.
    #[must_use]
    pub fn with_trigger_data(mut self, trigger_data: Map<String, JsonValue>) -> Self {
        self.trigger_data = trigger_data;
        self
    }

    /// Sets the contact.
    #[must_use]
    pub fn with_contact(mut self, contact_id: ContactId) -> Self {
        self.contact_id = Some(contact_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn action_defaults_to_start() {
        let json = json!({
            "workflow_id": WorkflowId::new(),
            "workspace_id": WorkspaceId::new(),
            "trigger_type": "trigger_form_submitted",
        });
        let message: TriggerMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(message.action, MessageAction::Start);
        assert!(message.workflow_run_id.is_none());
        assert!(message.trigger_data.is_empty());
    }

    #[test]
    fn resume_targets_the_run() {
        let start = TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_tag_added");
        let mut run = WorkflowRun::start(&start, Utc::now());
        run.current_node_id = Some("follow_up".to_string());

        let message = TriggerMessage::resume(&run, "key-1");

        assert_eq!(message.action, MessageAction::Resume);
        assert_eq!(message.workflow_run_id, Some(run.id));
        assert_eq!(message.next_node_id.as_deref(), Some("follow_up"));
        assert_eq!(message.wake_key.as_deref(), Some("key-1"));
    }

    #[test]
    fn restart_is_a_fresh_start_at_the_node() {
        let start = TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_tag_added")
            .with_trigger_data(json!({"tag": "vip"}).as_object().cloned().unwrap_or_default());
        let mut run = WorkflowRun::start(&start, Utc::now());
        run.variables.insert("score".to_string(), json!(3));

        let message = TriggerMessage::restart_at(&run, "send");

        assert_eq!(message.action, MessageAction::Start);
        assert!(message.workflow_run_id.is_none());
        assert_eq!(message.next_node_id.as_deref(), Some("send"));
        assert_eq!(message.trigger_data["tag"], "vip");
        assert_eq!(message.variables["score"], 3);
    }

    #[test]
    fn wire_names_are_snake_case() {
        let message = TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_webhook");
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["action"], "start");
        assert!(json.get("wake_key").is_none());
        assert!(json.get("next_node_id").is_some());
    }
}
