//! Bounded, jittered retry policy.
//!
//! An operation is attempted once and then retried at most `max_retries`
//! times. Between attempts the policy sleeps for
//!
//! ```text
//! delay(n) = min(max_delay, base_delay * exponential_base^n) * (1 + j),  j in [0, jitter_factor]
//! ```
//!
//! where `n` is the zero-based index of the failed attempt. Jitter comes from a
//! seedable RNG so a fixed seed reproduces the same delays.

use crate::node::NodeCategory;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    /// Network blips, throttling, timeouts.
    Transient,
    /// Validation failures and permanent provider rejections.
    Permanent,
}

/// Errors that know their own retryability.
pub trait Retryable {
    /// Classifies this error.
    fn retryable_kind(&self) -> RetryableKind;
}

const PERMANENT_PATTERNS: &[&str] = &[
    "invalid credentials",
    "unauthorized",
    "forbidden",
    "not found",
    "invalid request",
    "bad request",
    "invalid format",
    "validation error",
    "invalid recipient",
    "unsupported",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "throttl",
    "rate limit",
    "service unavailable",
    "too many requests",
    "connection reset",
    "temporary failure",
    "try again",
];

/// Classifies an error message.
///
/// Permanent patterns are checked first. Messages matching neither list are
/// treated as transient.
#[must_use]
pub fn classify_error(message: &str) -> RetryableKind {
    let lower = message.to_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RetryableKind::Permanent;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RetryableKind::Transient;
    }
    RetryableKind::Transient
}

/// How the un-jittered delay grows with the attempt index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * exponential_base^n`.
    #[default]
    Exponential,
    /// `base * (n + 1)`.
    Linear,
    /// `base`.
    Constant,
    /// `base * fib(n + 1)`.
    Fibonacci,
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Upper bound of the jitter fraction.
    pub jitter_factor: f64,
    /// Growth factor for exponential backoff.
    pub exponential_base: f64,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Seed for the jitter RNG. Entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            exponential_base: 2.0,
            strategy: BackoffStrategy::Exponential,
            seed: None,
        }
    }
}

impl RetryConfig {
    /// Email and SMS providers.
    #[must_use]
    pub fn provider() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
            ..Self::default()
        }
    }

    /// Webhooks and other third-party endpoints.
    #[must_use]
    pub fn external() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
            ..Self::default()
        }
    }

    /// Model invocations.
    #[must_use]
    pub fn ai() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.25,
            ..Self::default()
        }
    }

    /// Settings for a node category. Core nodes are never retried.
    #[must_use]
    pub fn for_category(category: NodeCategory) -> Self {
        match category {
            NodeCategory::Core => Self {
                max_retries: 0,
                ..Self::default()
            },
            NodeCategory::Provider => Self::provider(),
            NodeCategory::External => Self::external(),
            NodeCategory::Ai => Self::ai(),
        }
    }

    /// Fixes the jitter seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Un-jittered delay after the failed attempt `attempt` (zero-based).
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.min(64);
        let factor = match self.strategy {
            BackoffStrategy::Exponential => self.exponential_base.powi(n as i32),
            BackoffStrategy::Linear => f64::from(n + 1),
            BackoffStrategy::Constant => 1.0,
            BackoffStrategy::Fibonacci => fibonacci(n + 1) as f64,
        };
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Outcome of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryResult<T, E> {
    /// Whether an attempt succeeded.
    pub success: bool,
    /// The successful value.
    pub value: Option<T>,
    /// The last error, when no attempt succeeded.
    pub error: Option<E>,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub total_delay: Duration,
    /// Classification of the last error.
    pub error_kind: Option<RetryableKind>,
}

/// Counters across all operations run through one policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_attempts: u64,
    pub total_delay: Duration,
}

/// Executes operations with bounded, jittered retries.
pub struct RetryPolicy {
    config: RetryConfig,
    rng: Mutex<StdRng>,
    metrics: Mutex<RetryMetrics>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            metrics: Mutex::new(RetryMetrics::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered delay after the failed attempt `attempt` (zero-based).
    ///
    /// Draws from the policy's RNG, so successive calls differ unless the
    /// jitter factor is zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_for(attempt);
        let jitter_factor = self.config.jitter_factor.max(0.0);
        let jitter = if jitter_factor > 0.0 {
            self.rng.lock().unwrap().gen_range(0.0..=jitter_factor)
        } else {
            0.0
        };
        base.mul_f64(1.0 + jitter)
    }

    /// Whether another attempt is allowed after `attempts` attempts failed
    /// with an error of the given kind.
    #[must_use]
    pub fn should_retry(&self, attempts: u32, kind: RetryableKind) -> bool {
        kind == RetryableKind::Transient && attempts <= self.config.max_retries
    }

    /// Runs `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `op` receives the zero-based attempt index.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        let result = loop {
            let attempt = attempts;
            attempts += 1;

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts, "operation succeeded after retry");
                    }
                    break RetryResult {
                        success: true,
                        value: Some(value),
                        error: None,
                        attempts,
                        total_delay,
                        error_kind: None,
                    };
                }
                Err(error) => {
                    let kind = error.retryable_kind();
                    if !self.should_retry(attempts, kind) {
                        warn!(
                            attempts,
                            error_kind = ?kind,
                            error = %error,
                            "operation failed, not retrying"
                        );
                        break RetryResult {
                            success: false,
                            value: None,
                            error: Some(error),
                            attempts,
                            total_delay,
                            error_kind: Some(kind),
                        };
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    total_delay += delay;
                }
            }
        };

        let mut metrics = self.metrics.lock().unwrap();
        metrics.total_operations += 1;
        metrics.total_attempts += u64::from(result.attempts);
        metrics.total_delay += result.total_delay;
        if result.success {
            metrics.successful_operations += 1;
        } else {
            metrics.failed_operations += 1;
        }
        drop(metrics);

        result
    }

    /// Snapshot of the policy's counters.
    #[must_use]
    pub fn metrics(&self) -> RetryMetrics {
        self.metrics.lock().unwrap().clone()
    }
}
