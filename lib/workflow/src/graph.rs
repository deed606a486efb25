//! Workflow graphs as seen by the run lifecycle.
//!
//! Graphs are authored and validated elsewhere; the lifecycle only needs
//! node lookup and successor resolution.

use crate::error::GraphError;
use amber_relay_core::{WorkflowId, WorkspaceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

/// A directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
}

/// A workflow's nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub entry_node_id: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    /// Creates an empty graph entered at `entry_node_id`.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, workspace_id: WorkspaceId, entry_node_id: impl Into<String>) -> Self {
        Self {
            workflow_id,
            workspace_id,
            entry_node_id: entry_node_id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(
        mut self,
        id: impl Into<String>,
        node_type: impl Into<String>,
        config: Map<String, JsonValue>,
    ) -> Self {
        self.nodes.push(GraphNode {
            id: id.into(),
            node_type: node_type.into(),
            config,
        });
        self
    }

    /// Adds an edge.
    #[must_use]
    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(GraphEdge {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Target of the first outgoing edge of `id`.
    #[must_use]
    pub fn successor(&self, id: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|edge| edge.source == id)
            .map(|edge| edge.target.as_str())
    }
}

/// Loads workflow graphs.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    /// Loads the graph of `workflow_id` in `workspace_id`.
    async fn load(
        &self,
        workflow_id: WorkflowId,
        workspace_id: WorkspaceId,
    ) -> Result<WorkflowGraph, GraphError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new(WorkflowId::new(), WorkspaceId::new(), "trigger")
            .with_node("trigger", "trigger_tag_added", Map::new())
            .with_node("send", "action_send_email", Map::new())
            .with_node("alt", "action_send_sms", Map::new())
            .with_edge("trigger", "send")
            .with_edge("trigger", "alt")
    }

    #[test]
    fn successor_is_first_outgoing_edge() {
        let graph = graph();
        assert_eq!(graph.successor("trigger"), Some("send"));
        assert_eq!(graph.successor("send"), None);
    }

    #[test]
    fn node_lookup() {
        let graph = graph();
        assert_eq!(graph.node("alt").map(|n| n.node_type.as_str()), Some("action_send_sms"));
        assert!(graph.node("missing").is_none());
    }
}
