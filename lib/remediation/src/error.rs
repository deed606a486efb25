//! Error types for the remediation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `FixError`: a payload fix could not be applied
//! - `AlertError`, `RequeueError`, `FailureStoreError`: raised by the
//!   collaborators behind the pipeline's seam traits
//! - `PipelineError`: one DLQ message could not reach a terminal disposition
//!
//! Failure records are best effort; a `FailureStoreError` is logged and the
//! message is still acknowledged once its alert is delivered.
//!
//! A `PipelineError` never aborts a batch. The message is reported back as a
//! batch item failure so the transport redelivers it.

use crate::alert::AlertChannel;
use crate::classifier::Fix;
use std::fmt;

/// Errors from applying a payload fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixError {
    /// None of the fields the fix targets are present.
    NoMatchingField { fix: Fix },
    /// A targeted field holds a value the fix cannot repair.
    InvalidValue {
        fix: Fix,
        field: String,
        value: String,
    },
}

impl fmt::Display for FixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingField { fix } => write!(f, "{fix}: no applicable field in payload"),
            Self::InvalidValue { fix, field, value } => {
                write!(f, "{fix}: cannot repair {field}='{value}'")
            }
        }
    }
}

impl std::error::Error for FixError {}

/// Errors from alert delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    /// One channel failed to deliver.
    ChannelFailed {
        channel: AlertChannel,
        message: String,
    },
    /// No sink is registered for the channel.
    ChannelUnavailable { channel: AlertChannel },
    /// Every selected channel failed.
    AllChannelsFailed { attempted: usize },
}

impl fmt::Display for AlertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelFailed { channel, message } => {
                write!(f, "alert delivery over {channel} failed: {message}")
            }
            Self::ChannelUnavailable { channel } => write!(f, "no sink for alert channel {channel}"),
            Self::AllChannelsFailed { attempted } => {
                write!(f, "alert delivery failed on all {attempted} channels")
            }
        }
    }
}

impl std::error::Error for AlertError {}

/// Errors from re-injecting a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueError {
    /// Serializing the payload failed.
    SerializeFailed { message: String },
    /// The transport rejected the message.
    PublishFailed { message: String },
}

impl fmt::Display for RequeueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializeFailed { message } => write!(f, "failed to serialize payload: {message}"),
            Self::PublishFailed { message } => write!(f, "failed to requeue payload: {message}"),
        }
    }
}

impl std::error::Error for RequeueError {}

/// Errors from persisting failure records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureStoreError {
    /// The backing store failed.
    StorageFailed { message: String },
}

impl fmt::Display for FailureStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageFailed { message } => write!(f, "failure store failed: {message}"),
        }
    }
}

impl std::error::Error for FailureStoreError {}

/// Errors from handling one DLQ message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Re-injection failed.
    Requeue(RequeueError),
    /// The alert could not be delivered anywhere.
    Alert(AlertError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requeue(e) => write!(f, "{e}"),
            Self::Alert(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<RequeueError> for PipelineError {
    fn from(e: RequeueError) -> Self {
        Self::Requeue(e)
    }
}

impl From<AlertError> for PipelineError {
    fn from(e: AlertError) -> Self {
        Self::Alert(e)
    }
}
