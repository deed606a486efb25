//! Error types for the warm-up crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `StoreError`, `CheckerError`, `QueueError`, `TransportError`: raised by
//!   the collaborators behind the crate's seam traits
//! - `WarmupError`: a warm-up lifecycle operation was rejected or failed
//! - `HealthError`: a domain health check could not be produced
//! - `SendError`: an outbound email was neither sent nor deferred
//!
//! `SendRateGovernor::check_limit` never returns an error. Store failures on
//! the hot path admit the send and are logged instead.

use crate::domain::WarmupStatus;
use std::fmt;

/// Errors from the warm-up record and counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    Unavailable { message: String },
    /// A record already exists for the domain.
    AlreadyExists { domain: String },
    /// The record changed since it was read.
    Conflict { domain: String },
    /// No record exists for the domain.
    NotFound { domain: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "warm-up store unavailable: {message}"),
            Self::AlreadyExists { domain } => write!(f, "warm-up record exists for {domain}"),
            Self::Conflict { domain } => write!(f, "concurrent update to warm-up record for {domain}"),
            Self::NotFound { domain } => write!(f, "no warm-up record for {domain}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from external DNS and authentication checkers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckerError {
    /// The lookup failed.
    LookupFailed { domain: String, message: String },
}

impl fmt::Display for CheckerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LookupFailed { domain, message } => {
                write!(f, "lookup for {domain} failed: {message}")
            }
        }
    }
}

impl std::error::Error for CheckerError {}

/// Errors from the deferred-email queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The email could not be serialized.
    SerializeFailed { message: String },
    /// The transport rejected the message.
    PublishFailed { message: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializeFailed { message } => write!(f, "failed to serialize email: {message}"),
            Self::PublishFailed { message } => write!(f, "failed to enqueue email: {message}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors from the email delivery transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The provider rejected the message.
    Rejected { message: String },
    /// The provider could not be reached.
    Unavailable { message: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { message } => write!(f, "email rejected: {message}"),
            Self::Unavailable { message } => write!(f, "email provider unavailable: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors from warm-up lifecycle operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WarmupError {
    /// No warm-up exists for the domain.
    NotFound { domain: String },
    /// A non-pending warm-up already exists for the domain.
    AlreadyExists { domain: String },
    /// The warm-up is not in a state that allows the operation.
    InvalidState {
        domain: String,
        status: WarmupStatus,
        expected: WarmupStatus,
    },
    /// A start request field is out of range.
    InvalidRequest { field: &'static str, message: String },
    /// The domain is not verified or has no DKIM.
    DomainNotReady { domain: String, reasons: Vec<String> },
    /// The backing store failed.
    Store(StoreError),
}

impl fmt::Display for WarmupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { domain } => write!(f, "no warm-up for domain {domain}"),
            Self::AlreadyExists { domain } => write!(f, "warm-up already exists for domain {domain}"),
            Self::InvalidState {
                domain,
                status,
                expected,
            } => write!(f, "warm-up for {domain} is {status}, expected {expected}"),
            Self::InvalidRequest { field, message } => write!(f, "invalid {field}: {message}"),
            Self::DomainNotReady { domain, reasons } => {
                write!(f, "domain {domain} is not ready for warm-up: {}", reasons.join("; "))
            }
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WarmupError {}

impl From<StoreError> for WarmupError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { domain } => Self::NotFound { domain },
            StoreError::AlreadyExists { domain } => Self::AlreadyExists { domain },
            other => Self::Store(other),
        }
    }
}

/// Errors from domain health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    /// The warm-up record could not be read.
    Store(StoreError),
}

impl fmt::Display for HealthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "health check failed: {e}"),
        }
    }
}

impl std::error::Error for HealthError {}

impl From<StoreError> for HealthError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Errors from governed email sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The send was denied and no deferred queue is configured.
    NoDeferredQueue { domain: String },
    /// The send was denied and enqueueing it failed.
    DeferFailed { domain: String, message: String },
    /// The email provider failed.
    Transport(TransportError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDeferredQueue { domain } => {
                write!(f, "send limit reached for {domain} and no deferred queue is configured")
            }
            Self::DeferFailed { domain, message } => {
                write!(f, "failed to defer email for {domain}: {message}")
            }
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_warmup_not_found() {
        let err = WarmupError::from(StoreError::NotFound {
            domain: "mail.example.com".to_string(),
        });
        assert_eq!(
            err,
            WarmupError::NotFound {
                domain: "mail.example.com".to_string()
            }
        );
    }

    #[test]
    fn invalid_state_names_both_statuses() {
        let err = WarmupError::InvalidState {
            domain: "mail.example.com".to_string(),
            status: WarmupStatus::Active,
            expected: WarmupStatus::Paused,
        };
        assert_eq!(
            err.to_string(),
            "warm-up for mail.example.com is active, expected paused"
        );
    }
}
