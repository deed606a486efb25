//! Node execution requests, results, and risk categories.
//!
//! A node is one step of a workflow. The dispatcher sees only the node's
//! type identifier, its id, its configuration and the execution context;
//! graph structure lives in the workflow crate.

use crate::error::NodeExecutionError;
use amber_relay_core::{ContactId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Risk category of a node type.
///
/// Core nodes never call untrusted systems and bypass protection entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Triggers, logic, waits and local state updates.
    Core,
    /// First-party messaging providers (email, SMS).
    Provider,
    /// Arbitrary third-party endpoints (webhooks).
    External,
    /// Model invocations.
    Ai,
}

impl NodeCategory {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Provider => "provider",
            Self::External => "external",
            Self::Ai => "ai",
        }
    }

    /// Returns true if nodes of this category run behind breaker and retry.
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        !matches!(self, Self::Core)
    }
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CORE_NODE_TYPES: &[&str] = &[
    "trigger_form_submitted",
    "trigger_chat_message",
    "trigger_tag_added",
    "trigger_webhook",
    "trigger_schedule",
    "trigger_segment_event",
    "logic_branch",
    "logic_ab_split",
    "logic_filter",
    "action_wait",
    "action_update_contact",
];

const PROVIDER_NODE_TYPES: &[&str] = &["action_send_email", "action_send_sms"];

const EXTERNAL_NODE_TYPES: &[&str] = &["action_webhook"];

const AI_NODE_TYPES: &[&str] = &["ai_decision", "ai_generate", "ai_analyze", "action_ai_respond"];

/// Resolves the category of a node type.
///
/// Unknown types shaped like `provider.action` are treated as provider
/// nodes; every other unknown type is core.
#[must_use]
pub fn categorize(node_type: &str) -> NodeCategory {
    if CORE_NODE_TYPES.contains(&node_type) {
        NodeCategory::Core
    } else if PROVIDER_NODE_TYPES.contains(&node_type) {
        NodeCategory::Provider
    } else if EXTERNAL_NODE_TYPES.contains(&node_type) {
        NodeCategory::External
    } else if AI_NODE_TYPES.contains(&node_type) {
        NodeCategory::Ai
    } else if is_destination_shaped(node_type) {
        NodeCategory::Provider
    } else {
        NodeCategory::Core
    }
}

/// Computes the circuit-breaker destination for a node.
///
/// `provider.action` types are used as-is, legacy types go through a fixed
/// table, and anything else becomes `node.<type>`.
#[must_use]
pub fn circuit_id(node_type: &str, node_id: &str) -> String {
    if is_destination_shaped(node_type) {
        return node_type.to_string();
    }

    let mapped = match node_type {
        "action_send_sms" => "twilio.send_sms",
        "action_send_email" => "ses.send_email",
        "action_webhook" => return format!("webhook.{node_id}"),
        "ai_decision" => "bedrock.decision",
        "ai_generate" => "bedrock.generate",
        "ai_analyze" => "bedrock.analyze",
        "action_ai_respond" => "bedrock.respond",
        other => return format!("node.{other}"),
    };
    mapped.to_string()
}

fn is_destination_shaped(node_type: &str) -> bool {
    match node_type.split_once('.') {
        Some((provider, action)) => !provider.is_empty() && !action.is_empty(),
        None => false,
    }
}

/// Data available to a node while it executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Payload of the trigger that started the run.
    #[serde(default)]
    pub trigger_data: Map<String, JsonValue>,
    /// Variables accumulated by earlier nodes.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// The contact the run is acting on, if any.
    #[serde(default)]
    pub contact_id: Option<ContactId>,
}

/// One request to execute a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRequest {
    /// Node type identifier, e.g. `action_send_email` or `ses.send_email`.
    pub node_type: String,
    /// Node id within its workflow.
    pub node_id: String,
    /// Tenant the run belongs to.
    pub workspace_id: WorkspaceId,
    /// Node configuration from the workflow definition.
    #[serde(default)]
    pub config: Map<String, JsonValue>,
    /// Execution context.
    #[serde(default)]
    pub context: ExecutionContext,
    /// Zero-based attempt index within the current dispatch.
    #[serde(default)]
    pub attempt: u32,
}

impl NodeExecutionRequest {
    /// Creates a request with empty configuration and context.
    #[must_use]
    pub fn new(
        node_type: impl Into<String>,
        node_id: impl Into<String>,
        workspace_id: WorkspaceId,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            node_id: node_id.into(),
            workspace_id,
            config: Map::new(),
            context: ExecutionContext::default(),
            attempt: 0,
        }
    }

    /// Sets the node configuration.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, JsonValue>) -> Self {
        self.config = config;
        self
    }

    /// Sets the execution context.
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// A copy of this request for the zero-based `attempt`.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Returns true on the first attempt of a dispatch.
    #[must_use]
    pub fn is_first_attempt(&self) -> bool {
        self.attempt == 0
    }

    /// The category of this request's node type.
    #[must_use]
    pub fn category(&self) -> NodeCategory {
        categorize(&self.node_type)
    }

    /// The circuit-breaker destination of this request.
    #[must_use]
    pub fn circuit_id(&self) -> String {
        circuit_id(&self.node_type, &self.node_id)
    }
}

/// Status of a node result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// The node finished.
    Completed,
    /// The node failed.
    Failed,
    /// The node asked the run to pause.
    Waiting,
}

/// Outcome of executing one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Whether the node succeeded. Waiting counts as success.
    pub success: bool,
    /// Result status.
    pub status: NodeStatus,
    /// Node output.
    #[serde(default)]
    pub output: Map<String, JsonValue>,
    /// Variables to merge into run state.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Error message when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How long to wait before the next node, when waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
    /// Successor override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    /// Provider-specific error code when failed, e.g. `21211`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Provider that reported the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl NodeResult {
    /// A completed result with no output.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            success: true,
            status: NodeStatus::Completed,
            output: Map::new(),
            variables: Map::new(),
            error: None,
            wait_seconds: None,
            next_node_id: None,
            error_code: None,
            provider: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: NodeStatus::Failed,
            error: Some(error.into()),
            ..Self::completed()
        }
    }

    /// A failed result carrying the provider and code of `err`, if any.
    #[must_use]
    pub fn from_error(err: &NodeExecutionError) -> Self {
        let mut result = Self::failed(err.to_string());
        match err {
            NodeExecutionError::Provider { provider, code, .. } => {
                result.provider = Some(provider.clone());
                result.error_code = code.clone();
            }
            NodeExecutionError::ExternalService { service, .. } => {
                result.provider = Some(service.clone());
            }
            _ => {}
        }
        result
    }

    /// A waiting result.
    #[must_use]
    pub fn waiting(wait_seconds: u64) -> Self {
        Self {
            status: NodeStatus::Waiting,
            wait_seconds: Some(wait_seconds),
            ..Self::completed()
        }
    }

    /// Sets the output map.
    #[must_use]
    pub fn with_output(mut self, output: Map<String, JsonValue>) -> Self {
        self.output = output;
        self
    }

    /// Adds a single output entry.
    #[must_use]
    pub fn with_output_value(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.output.insert(key.into(), value);
        self
    }

    /// Sets the variables to merge into the run.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the successor override.
    #[must_use]
    pub fn with_next_node(mut self, next_node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(next_node_id.into());
        self
    }

    /// Returns true if the node asked the run to pause for a positive duration.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.status == NodeStatus::Waiting && self.wait_seconds.unwrap_or(0) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_categorize() {
        assert_eq!(categorize("logic_branch"), NodeCategory::Core);
        assert_eq!(categorize("action_wait"), NodeCategory::Core);
        assert_eq!(categorize("action_send_sms"), NodeCategory::Provider);
        assert_eq!(categorize("action_webhook"), NodeCategory::External);
        assert_eq!(categorize("ai_generate"), NodeCategory::Ai);
        assert_eq!(categorize("action_ai_respond"), NodeCategory::Ai);
    }

    #[test]
    fn unknown_types_default_by_shape() {
        assert_eq!(categorize("mailgun.send_email"), NodeCategory::Provider);
        assert_eq!(categorize("custom_step"), NodeCategory::Core);
        assert_eq!(categorize(".broken"), NodeCategory::Core);
    }

    #[test]
    fn circuit_ids() {
        assert_eq!(circuit_id("ses.send_email", "n1"), "ses.send_email");
        assert_eq!(circuit_id("action_send_sms", "n1"), "twilio.send_sms");
        assert_eq!(circuit_id("action_send_email", "n1"), "ses.send_email");
        assert_eq!(circuit_id("action_webhook", "hook-7"), "webhook.hook-7");
        assert_eq!(circuit_id("ai_decision", "n1"), "bedrock.decision");
        assert_eq!(circuit_id("custom_step", "n1"), "node.custom_step");
    }

    #[test]
    fn waiting_requires_positive_duration() {
        assert!(NodeResult::waiting(30).is_waiting());
        assert!(!NodeResult::waiting(0).is_waiting());
        assert!(!NodeResult::completed().is_waiting());
    }

    #[test]
    fn failed_result_shape() {
        let result = NodeResult::failed("boom");
        assert!(!result.success);
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn provider_errors_carry_code_into_result() {
        let result = NodeResult::from_error(&NodeExecutionError::Provider {
            provider: "twilio".to_string(),
            code: Some("21211".to_string()),
            message: "Invalid 'To' Phone Number".to_string(),
        });
        assert!(!result.success);
        assert_eq!(result.provider.as_deref(), Some("twilio"));
        assert_eq!(result.error_code.as_deref(), Some("21211"));

        let timeout = NodeResult::from_error(&NodeExecutionError::Timeout { seconds: 30 });
        assert_eq!(timeout.provider, None);
        assert_eq!(timeout.error_code, None);
    }

    #[test]
    fn attempt_copies_keep_the_rest_of_the_request() {
        let request = NodeExecutionRequest::new("action_send_email", "n1", WorkspaceId::new());
        assert!(request.is_first_attempt());
        let retry = request.for_attempt(2);
        assert_eq!(retry.attempt, 2);
        assert!(!retry.is_first_attempt());
        assert_eq!(retry.node_id, request.node_id);
    }

    #[test]
    fn node_result_serde_omits_empty_optionals() {
        let json = serde_json::to_value(NodeResult::completed()).expect("serialize");
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
        assert!(json.get("wait_seconds").is_none());
        assert!(json.get("error_code").is_none());
    }
}
