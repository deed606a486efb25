//! Node dispatch for amber-relay.
//!
//! Every node execution passes through [`NodeDispatcher`], which classifies
//! the node, consults the destination's circuit breaker and applies the
//! category's retry policy before calling the registered executor.

pub mod circuit_breaker;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod node;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStatus,
};
pub use dispatcher::{DispatchMetrics, DispatchResult, NodeDispatcher, execution_timeout};
pub use error::{NodeExecutionError, RegistryError};
pub use executor::{ExecutorRegistry, MockExecutor, NodeExecutor, PassthroughExecutor, WaitExecutor};
pub use node::{
    ExecutionContext, NodeCategory, NodeExecutionRequest, NodeResult, NodeStatus, categorize,
    circuit_id,
};
pub use retry::{
    BackoffStrategy, RetryConfig, RetryMetrics, RetryPolicy, RetryResult, Retryable,
    RetryableKind, classify_error,
};
