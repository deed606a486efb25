//! Node dispatcher.
//!
//! Routes each node execution by risk category. Core nodes run directly;
//! provider, external and AI nodes run behind the destination's circuit
//! breaker and a category-tuned retry policy. The dispatcher never returns
//! an error: every fault ends up as a failed [`NodeResult`].

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStatus};
use crate::error::NodeExecutionError;
use crate::executor::{ExecutorRegistry, NodeExecutor};
use crate::node::{NodeCategory, NodeExecutionRequest, NodeResult};
use crate::retry::{RetryConfig, RetryPolicy};
use amber_relay_core::{FeatureFlags, Flag};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Upper bound on a single attempt for a category.
#[must_use]
pub const fn execution_timeout(category: NodeCategory) -> Duration {
    match category {
        NodeCategory::Core => Duration::from_secs(10),
        NodeCategory::Provider | NodeCategory::External => Duration::from_secs(30),
        NodeCategory::Ai => Duration::from_secs(60),
    }
}

/// Outcome of a dispatch, with observability metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub node_result: NodeResult,
    pub category: NodeCategory,
    /// Breaker state after the dispatch; `None` when no breaker was consulted.
    pub circuit_state: Option<CircuitState>,
    pub retry_attempts: u32,
    pub total_retry_delay: Duration,
    pub execution_time_ms: u64,
    pub fallback_used: bool,
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub total_dispatches: u64,
    pub successful_dispatches: u64,
    pub failed_dispatches: u64,
    pub circuit_rejections: u64,
    pub retried_dispatches: u64,
    pub fallbacks_used: u64,
    pub by_category: HashMap<String, u64>,
    pub by_node_type: HashMap<String, u64>,
}

/// Routes node executions through protection layers.
pub struct NodeDispatcher {
    executors: ExecutorRegistry,
    breakers: CircuitBreakerRegistry,
    flags: Arc<FeatureFlags>,
    retry_policies: HashMap<NodeCategory, RetryPolicy>,
    metrics: Mutex<DispatchMetrics>,
}

impl NodeDispatcher {
    /// Creates a dispatcher with the default per-category retry settings.
    #[must_use]
    pub fn new(
        executors: ExecutorRegistry,
        breakers: CircuitBreakerRegistry,
        flags: Arc<FeatureFlags>,
    ) -> Self {
        let retry_policies = [NodeCategory::Provider, NodeCategory::External, NodeCategory::Ai]
            .into_iter()
            .map(|category| (category, RetryPolicy::new(RetryConfig::for_category(category))))
            .collect();
        Self {
            executors,
            breakers,
            flags,
            retry_policies,
            metrics: Mutex::new(DispatchMetrics::default()),
        }
    }

    /// Overrides the retry settings of one category.
    #[must_use]
    pub fn with_retry_config(mut self, category: NodeCategory, config: RetryConfig) -> Self {
        self.retry_policies.insert(category, RetryPolicy::new(config));
        self
    }

    /// Seeds every retry policy's jitter, for reproducible delays.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        for policy in self.retry_policies.values_mut() {
            *policy = RetryPolicy::new(policy.config().clone().with_seed(seed));
        }
        self
    }

    /// Executes `request`, optionally substituting `fallback` when the
    /// destination's circuit is open.
    #[instrument(
        skip(self, request, fallback),
        fields(
            node_type = %request.node_type,
            node_id = %request.node_id,
            workspace_id = %request.workspace_id,
        )
    )]
    pub async fn dispatch(
        &self,
        request: &NodeExecutionRequest,
        fallback: Option<NodeResult>,
    ) -> DispatchResult {
        let started = Instant::now();
        let category = request.category();

        let Some(executor) = self.executors.get(&request.node_type) else {
            warn!("no executor registered");
            let err = NodeExecutionError::UnsupportedNodeType {
                node_type: request.node_type.clone(),
            };
            let result = DispatchResult {
                node_result: NodeResult::from_error(&err),
                category,
                circuit_state: None,
                retry_attempts: 0,
                total_retry_delay: Duration::ZERO,
                execution_time_ms: elapsed_ms(started),
                fallback_used: false,
            };
            self.record(request, &result, false);
            return result;
        };

        let protected = category.is_protected()
            && self.flags.is_enabled(Flag::UseNodeDispatcher, request.workspace_id);

        let result = if protected {
            self.dispatch_protected(request, executor, category, fallback, started)
                .await
        } else {
            let node_result = match execute_once(&executor, request, execution_timeout(category)).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "direct execution failed");
                    NodeResult::from_error(&err)
                }
            };
            DispatchResult {
                node_result,
                category,
                circuit_state: None,
                retry_attempts: 1,
                total_retry_delay: Duration::ZERO,
                execution_time_ms: elapsed_ms(started),
                fallback_used: false,
            }
        };

        self.record(request, &result, false);
        result
    }

    async fn dispatch_protected(
        &self,
        request: &NodeExecutionRequest,
        executor: Arc<dyn NodeExecutor>,
        category: NodeCategory,
        fallback: Option<NodeResult>,
        started: Instant,
    ) -> DispatchResult {
        let use_breaker = self
            .flags
            .is_enabled(Flag::UseCircuitBreaker, request.workspace_id);
        let destination = request.circuit_id();

        if use_breaker {
            self.breakers
                .ensure(&destination, CircuitBreakerConfig::for_category(category));
            if !self.breakers.should_allow_request(&destination) {
                let state = self.breakers.state(&destination);
                let fallback_used = fallback.is_some();
                let node_result = fallback.unwrap_or_else(|| {
                    NodeResult::failed(format!("Circuit breaker open for {destination}"))
                        .with_output_value("circuit_state", JsonValue::from(state.as_str()))
                });
                debug!(%destination, fallback_used, "request denied by circuit breaker");
                let result = DispatchResult {
                    node_result,
                    category,
                    circuit_state: Some(state),
                    retry_attempts: 0,
                    total_retry_delay: Duration::ZERO,
                    execution_time_ms: elapsed_ms(started),
                    fallback_used,
                };
                self.record(request, &result, true);
                return result;
            }
        }

        let limit = execution_timeout(category);
        let attempt = |attempt: u32| {
            let executor = Arc::clone(&executor);
            let request = request.for_attempt(attempt);
            async move { execute_once(&executor, &request, limit).await }
        };
        let outcome = match self.retry_policies.get(&category) {
            Some(policy) => policy.execute(attempt).await,
            None => {
                RetryPolicy::new(RetryConfig::for_category(category))
                    .execute(attempt)
                    .await
            }
        };

        let node_result = match (outcome.value, outcome.error) {
            (Some(result), _) => result,
            (None, Some(err)) => NodeResult::from_error(&err),
            (None, None) => NodeResult::failed("execution produced no result"),
        };

        let circuit_state = if use_breaker {
            if node_result.success {
                self.breakers.record_success(&destination);
            } else {
                self.breakers.record_failure(&destination);
            }
            Some(self.breakers.state(&destination))
        } else {
            None
        };

        DispatchResult {
            node_result,
            category,
            circuit_state,
            retry_attempts: outcome.attempts,
            total_retry_delay: outcome.total_delay,
            execution_time_ms: elapsed_ms(started),
            fallback_used: false,
        }
    }

    fn record(&self, request: &NodeExecutionRequest, result: &DispatchResult, rejected: bool) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.total_dispatches += 1;
        if result.node_result.success {
            metrics.successful_dispatches += 1;
        } else {
            metrics.failed_dispatches += 1;
        }
        if rejected {
            metrics.circuit_rejections += 1;
        }
        if result.retry_attempts > 1 {
            metrics.retried_dispatches += 1;
        }
        if result.fallback_used {
            metrics.fallbacks_used += 1;
        }
        *metrics
            .by_category
            .entry(result.category.as_str().to_string())
            .or_default() += 1;
        *metrics
            .by_node_type
            .entry(request.node_type.clone())
            .or_default() += 1;
    }

    /// Snapshot of the dispatch counters.
    #[must_use]
    pub fn metrics(&self) -> DispatchMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Clears the dispatch counters.
    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap() = DispatchMetrics::default();
    }

    /// Status of every known circuit breaker.
    #[must_use]
    pub fn circuit_status(&self) -> Vec<CircuitStatus> {
        self.breakers.status_all()
    }
}

async fn execute_once(
    executor: &Arc<dyn NodeExecutor>,
    request: &NodeExecutionRequest,
    limit: Duration,
) -> Result<NodeResult, NodeExecutionError> {
    match tokio::time::timeout(limit, executor.execute(request)).await {
        Ok(result) => result,
        Err(_) => Err(NodeExecutionError::Timeout {
            seconds: limit.as_secs(),
        }),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
