//! Per-destination circuit breakers.
//!
//! A destination is a `provider.action` string such as `ses.send_email`.
//! Each destination has its own breaker:
//!
//! - `closed`: requests flow; failures are counted.
//! - `open`: requests are refused without touching the network until the
//!   recovery timeout has elapsed.
//! - `half_open`: a bounded number of trial calls are let through. Enough
//!   consecutive successes close the circuit; any failure reopens it.

use crate::node::NodeCategory;
use amber_relay_core::{Clock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time an open circuit waits before probing, in seconds.
    pub recovery_timeout_secs: u64,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Rolling window for the failure rate, in seconds.
    pub metrics_window_secs: u64,
    /// Failure rate within the window that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Calls within the window needed before the rate is considered.
    pub minimum_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
            metrics_window_secs: 300,
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
        }
    }
}

impl CircuitBreakerConfig {
    /// Email and SMS providers.
    #[must_use]
    pub fn provider() -> Self {
        Self::default()
    }

    /// Third-party endpoints are assumed less reliable.
    #[must_use]
    pub fn external() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_secs: 30,
            half_open_max_calls: 2,
            metrics_window_secs: 180,
            failure_rate_threshold: 0.4,
            ..Self::default()
        }
    }

    /// Model outages tend to last longer.
    #[must_use]
    pub fn ai() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_secs: 120,
            half_open_max_calls: 2,
            metrics_window_secs: 300,
            failure_rate_threshold: 0.5,
            ..Self::default()
        }
    }

    /// Settings for a node category.
    #[must_use]
    pub fn for_category(category: NodeCategory) -> Self {
        match category {
            NodeCategory::Core | NodeCategory::Provider => Self::provider(),
            NodeCategory::External => Self::external(),
            NodeCategory::Ai => Self::ai(),
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::seconds(self.recovery_timeout_secs as i64)
    }

    fn metrics_window(&self) -> Duration {
        Duration::seconds(self.metrics_window_secs as i64)
    }
}

/// Call counters for one breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    recent_failures: VecDeque<DateTime<Utc>>,
    recent_successes: VecDeque<DateTime<Utc>>,
}

impl CircuitMetrics {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.recent_failures.front().is_some_and(|t| *t < cutoff) {
            self.recent_failures.pop_front();
        }
        while self.recent_successes.front().is_some_and(|t| *t < cutoff) {
            self.recent_successes.pop_front();
        }
    }

    fn window_calls(&self) -> usize {
        self.recent_failures.len() + self.recent_successes.len()
    }

    fn window_failure_rate(&self) -> f64 {
        let calls = self.window_calls();
        if calls == 0 {
            0.0
        } else {
            self.recent_failures.len() as f64 / calls as f64
        }
    }
}

/// A single destination's breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    metrics: CircuitMetrics,
    opened_at: Option<DateTime<Utc>>,
    half_open_calls: u32,
    last_state_change: DateTime<Utc>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            destination: destination.into(),
            config,
            state: CircuitState::Closed,
            metrics: CircuitMetrics::default(),
            opened_at: None,
            half_open_calls: 0,
            last_state_change: now,
        }
    }

    /// Current state, without advancing time.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> &CircuitMetrics {
        &self.metrics
    }

    /// Decides whether a request may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits the caller as its first trial call.
    pub fn should_allow_request(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .opened_at
                    .is_some_and(|opened| now - opened >= self.config.recovery_timeout());
                if recovered {
                    self.transition(CircuitState::HalfOpen, now);
                    self.half_open_calls = 1;
                    true
                } else {
                    self.metrics.rejected_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    self.metrics.rejected_calls += 1;
                    false
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.metrics.total_calls += 1;
        self.metrics.successful_calls += 1;
        self.metrics.consecutive_successes += 1;
        self.metrics.consecutive_failures = 0;
        self.metrics.recent_successes.push_back(now);
        self.metrics.prune(now - self.config.metrics_window());

        if self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
            if self.metrics.consecutive_successes >= self.config.success_threshold {
                self.transition(CircuitState::Closed, now);
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.metrics.total_calls += 1;
        self.metrics.failed_calls += 1;
        self.metrics.consecutive_failures += 1;
        self.metrics.consecutive_successes = 0;
        self.metrics.recent_failures.push_back(now);
        self.metrics.prune(now - self.config.metrics_window());

        match self.state {
            CircuitState::Closed => {
                let too_many = self.metrics.consecutive_failures >= self.config.failure_threshold;
                let rate_breached = self.metrics.window_calls() >= self.config.minimum_calls as usize
                    && self.metrics.window_failure_rate() >= self.config.failure_rate_threshold;
                if too_many || rate_breached {
                    self.transition(CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Failure rate inside the rolling window.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        self.metrics.window_failure_rate()
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            destination: self.destination.clone(),
            state: self.state,
            failure_rate: self.failure_rate(),
            total_calls: self.metrics.total_calls,
            failed_calls: self.metrics.failed_calls,
            rejected_calls: self.metrics.rejected_calls,
            consecutive_failures: self.metrics.consecutive_failures,
            opened_at: self.opened_at,
            last_state_change: self.last_state_change,
        }
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.half_open_calls = 0;
        self.last_state_change = now;

        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                warn!(
                    destination = %self.destination,
                    from = %from,
                    to = %to,
                    consecutive_failures = self.metrics.consecutive_failures,
                    failure_rate = self.failure_rate(),
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                self.metrics.consecutive_successes = 0;
                info!(destination = %self.destination, from = %from, to = %to, "circuit probing");
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.metrics.consecutive_failures = 0;
                info!(destination = %self.destination, from = %from, to = %to, "circuit closed");
            }
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub destination: String,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

/// Registry of breakers keyed by destination.
///
/// Breakers are created lazily on first reference. Every decision and every
/// recorded outcome happens under the registry lock.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry on the system clock.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, Arc::new(SystemClock))
    }

    /// Creates a registry on the given clock.
    #[must_use]
    pub fn with_clock(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Creates the breaker for `destination` with `config` if it does not exist yet.
    pub fn ensure(&self, destination: &str, config: CircuitBreakerConfig) {
        let now = self.clock.now();
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(destination.to_string())
            .or_insert_with(|| CircuitBreaker::new(destination, config, now));
    }

    /// Decides whether a request to `destination` may proceed.
    pub fn should_allow_request(&self, destination: &str) -> bool {
        self.with_breaker(destination, |breaker, now| breaker.should_allow_request(now))
    }

    /// Records a successful call to `destination`.
    pub fn record_success(&self, destination: &str) {
        self.with_breaker(destination, |breaker, now| breaker.record_success(now));
    }

    /// Records a failed call to `destination`.
    pub fn record_failure(&self, destination: &str) {
        self.with_breaker(destination, |breaker, now| breaker.record_failure(now));
    }

    /// State of `destination`; unknown destinations are closed.
    #[must_use]
    pub fn state(&self, destination: &str) -> CircuitState {
        self.breakers
            .read()
            .unwrap()
            .get(destination)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Returns true if `destination` is open.
    #[must_use]
    pub fn is_open(&self, destination: &str) -> bool {
        self.state(destination) == CircuitState::Open
    }

    /// Drops all state for `destination`.
    pub fn reset(&self, destination: &str) {
        if self.breakers.write().unwrap().remove(destination).is_some() {
            info!(destination, "circuit reset");
        }
    }

    /// Status of every known breaker, sorted by destination.
    #[must_use]
    pub fn status_all(&self) -> Vec<CircuitStatus> {
        let mut all: Vec<_> = self
            .breakers
            .read()
            .unwrap()
            .values()
            .map(CircuitBreaker::status)
            .collect();
        all.sort_by(|a, b| a.destination.cmp(&b.destination));
        all
    }

    fn with_breaker<R>(&self, destination: &str, f: impl FnOnce(&mut CircuitBreaker, DateTime<Utc>) -> R) -> R {
        let now = self.clock.now();
        let mut breakers = self.breakers.write().unwrap();
        let breaker = breakers
            .entry(destination.to_string())
            .or_insert_with(|| CircuitBreaker::new(destination, self.default_config.clone(), now));
        f(breaker, now)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl Clone for CircuitBreakerRegistry {
    fn clone(&self) -> Self {
        Self {
            default_config: self.default_config.clone(),
            breakers: Arc::clone(&self.breakers),
            clock: Arc::clone(&self.clock),
        }
    }
}
