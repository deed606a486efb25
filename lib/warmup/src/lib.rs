//! Email domain warm-up for amber-relay.
//!
//! New sending domains ramp their daily volume along a schedule.
//! [`SendRateGovernor`] admits or defers each outbound email against the
//! domain's send window and caps, pauses a warm-up when bounces or
//! complaints spike, and advances the schedule once per day.
//! [`GovernedSender`] queues denied emails instead of dropping them, and
//! [`SendEmailExecutor`] plugs all of this into node dispatch. Provider
//! feedback notifications feed the bounce and complaint counters.

pub mod deferred;
pub mod domain;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod governor;
pub mod health;
pub mod memory;
pub mod store;

pub use deferred::{DeferredEmail, DeferredQueue, EmailTransport, GovernedSender, OutboundEmail, SendOutcome};
pub use domain::{
    DEFAULT_WARMUP_SCHEDULE, StartWarmup, WarmupDomain, WarmupStatus, WarmupStatusReport,
    extract_domain, in_send_window, rate_percent, window_hours,
};
pub use error::{CheckerError, HealthError, QueueError, SendError, StoreError, TransportError, WarmupError};
pub use executor::{EMAIL_PROVIDER, SEND_EMAIL_NODE_TYPE, SendEmailExecutor};
pub use feedback::{
    CommandOutcome, FeedbackKind, FeedbackNotification, FeedbackOutcome, WarmupCommand,
};
pub use governor::{AdvanceSummary, DomainAuthChecker, DomainAuthStatus, SendRateGovernor, WarmupCheck};
pub use health::{
    CachedHealth, DnsHealth, DnsHealthChecker, DomainHealthReport, HealthInputs, HealthService,
    HealthStatus, compute_health_score, score_to_status,
};
pub use memory::{
    InMemoryWarmupStore, RecordingDeferredQueue, RecordingTransport, StaticAuthChecker,
    StaticDnsChecker,
};
pub use store::{CounterKind, DailyCounter, WarmupStore};
