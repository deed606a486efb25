//! Node executor seam and registry.

use crate::error::{NodeExecutionError, RegistryError};
use crate::node::{NodeExecutionRequest, NodeResult};
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Executes nodes of one or more types.
///
/// Implementations talk to providers, webhooks and models. They report
/// faults as `Err`; a returned `NodeResult` that is not successful is a
/// business-level failure and is never retried.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Executes a single node.
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<NodeResult, NodeExecutionError>;
}

/// Executors keyed by node type.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut node_types: Vec<_> = self.executors.keys().collect();
        node_types.sort();
        f.debug_struct("ExecutorRegistry")
            .field("node_types", &node_types)
            .finish()
    }
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor for `node_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if an executor is already registered for the type.
    pub fn register(
        &mut self,
        node_type: impl Into<String>,
        executor: Arc<dyn NodeExecutor>,
    ) -> Result<(), Report<RegistryError>> {
        let node_type = node_type.into();
        if self.executors.contains_key(&node_type) {
            return Err(RegistryError::DuplicateExecutor { node_type }.into());
        }
        self.executors.insert(node_type, executor);
        Ok(())
    }

    /// Builder-style registration that replaces any existing executor.
    #[must_use]
    pub fn with(mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.insert(node_type.into(), executor);
        self
    }

    /// Looks up the executor for `node_type`.
    #[must_use]
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Returns true if an executor exists for `node_type`.
    #[must_use]
    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }
}

/// Completes immediately, passing the node configuration through as output.
///
/// Used for triggers, filters and other local nodes with no side effects.
pub struct PassthroughExecutor;

#[async_trait]
impl NodeExecutor for PassthroughExecutor {
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<NodeResult, NodeExecutionError> {
        Ok(NodeResult::completed().with_output(request.config.clone()))
    }
}

/// Pauses the run for the configured number of seconds.
///
/// Reads `wait_seconds`, or `duration` combined with `unit`
/// (`seconds`, `minutes`, `hours`, `days`).
pub struct WaitExecutor;

impl WaitExecutor {
    fn wait_seconds(request: &NodeExecutionRequest) -> Result<u64, NodeExecutionError> {
        if let Some(seconds) = request.config.get("wait_seconds").and_then(JsonValue::as_u64) {
            return Ok(seconds);
        }
        let duration = request
            .config
            .get("duration")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| NodeExecutionError::InvalidInput {
                message: "wait node requires wait_seconds or duration".to_string(),
            })?;
        let multiplier = match request.config.get("unit").and_then(JsonValue::as_str) {
            None | Some("seconds") => 1,
            Some("minutes") => 60,
            Some("hours") => 3_600,
            Some("days") => 86_400,
            Some(other) => {
                return Err(NodeExecutionError::InvalidInput {
                    message: format!("unknown wait unit '{other}'"),
                });
            }
        };
        Ok(duration.saturating_mul(multiplier))
    }
}

#[async_trait]
impl NodeExecutor for WaitExecutor {
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<NodeResult, NodeExecutionError> {
        let seconds = Self::wait_seconds(request)?;
        Ok(NodeResult::waiting(seconds))
    }
}

/// A scripted executor for tests.
///
/// Replays the configured outcomes in order; the last one repeats.
pub struct MockExecutor {
    outcomes: Mutex<Vec<Result<NodeResult, NodeExecutionError>>>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl MockExecutor {
    /// Always returns a completed result with `output` merged in.
    #[must_use]
    pub fn succeeding(output: JsonValue) -> Self {
        let result = match output {
            JsonValue::Object(map) => NodeResult::completed().with_output(map),
            JsonValue::Null => NodeResult::completed(),
            other => NodeResult::completed().with_output_value("value", other),
        };
        Self::returning(Ok(result))
    }

    /// Always fails with `error`.
    #[must_use]
    pub fn failing(error: NodeExecutionError) -> Self {
        Self::returning(Err(error))
    }

    /// Always returns `outcome`.
    #[must_use]
    pub fn returning(outcome: Result<NodeResult, NodeExecutionError>) -> Self {
        Self::sequence(vec![outcome])
    }

    /// Returns `outcomes` in order, repeating the last.
    #[must_use]
    pub fn sequence(outcomes: Vec<Result<NodeResult, NodeExecutionError>>) -> Self {
        let mut outcomes = outcomes;
        outcomes.reverse();
        Self {
            outcomes: Mutex::new(outcomes),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Sleeps for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared handle on the call counter.
    #[must_use]
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }

    fn next_outcome(&self) -> Result<NodeResult, NodeExecutionError> {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop().unwrap_or_else(|| Ok(NodeResult::completed()))
        } else {
            outcomes
                .last()
                .cloned()
                .unwrap_or_else(|| Ok(NodeResult::completed()))
        }
    }
}

#[async_trait]
impl NodeExecutor for MockExecutor {
    async fn execute(&self, _request: &NodeExecutionRequest) -> Result<NodeResult, NodeExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_outcome()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_relay_core::WorkspaceId;
    use serde_json::json;

    fn request(node_type: &str, config: JsonValue) -> NodeExecutionRequest {
        let config = match config {
            JsonValue::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        NodeExecutionRequest::new(node_type, "n1", WorkspaceId::new()).with_config(config)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register("action_wait", Arc::new(WaitExecutor))
            .expect("first registration");
        let err = registry
            .register("action_wait", Arc::new(WaitExecutor))
            .expect_err("duplicate");
        assert!(err.to_string().contains("action_wait"));
    }

    #[test]
    fn with_replaces_and_get_finds() {
        let registry = ExecutorRegistry::new()
            .with("logic_filter", Arc::new(PassthroughExecutor))
            .with("logic_filter", Arc::new(PassthroughExecutor));
        assert!(registry.contains("logic_filter"));
        assert!(registry.get("action_webhook").is_none());
    }

    #[tokio::test]
    async fn wait_executor_reads_units() {
        let result = WaitExecutor
            .execute(&request("action_wait", json!({"duration": 2, "unit": "hours"})))
            .await
            .expect("wait");
        assert_eq!(result.wait_seconds, Some(7_200));
        assert!(result.is_waiting());

        let result = WaitExecutor
            .execute(&request("action_wait", json!({"wait_seconds": 45})))
            .await
            .expect("wait");
        assert_eq!(result.wait_seconds, Some(45));
    }

    #[tokio::test]
    async fn wait_executor_rejects_missing_duration() {
        let err = WaitExecutor
            .execute(&request("action_wait", json!({})))
            .await
            .expect_err("missing duration");
        assert!(matches!(err, NodeExecutionError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn passthrough_echoes_config() {
        let result = PassthroughExecutor
            .execute(&request("logic_filter", json!({"field": "tag"})))
            .await
            .expect("passthrough");
        assert_eq!(result.output["field"], "tag");
    }

    #[tokio::test]
    async fn mock_replays_sequence_then_repeats_last() {
        let mock = MockExecutor::sequence(vec![
            Err(NodeExecutionError::Timeout { seconds: 1 }),
            Ok(NodeResult::completed()),
        ]);
        let calls = mock.calls();
        let req = request("ses.send_email", json!({}));

        assert!(mock.execute(&req).await.is_err());
        assert!(mock.execute(&req).await.is_ok());
        assert!(mock.execute(&req).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
