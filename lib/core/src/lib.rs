//! Core domain types and utilities for the amber-relay platform.
//!
//! This crate provides the foundational types, error handling, and shared
//! utilities used by the dispatch, remediation and warm-up crates.

pub mod clock;
pub mod error;
pub mod flags;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorSurface, Result};
pub use flags::{FeatureFlags, Flag, FlagConfig};
pub use id::{
    AlertId, ContactId, FailureRecordId, ParseIdError, WakeId, WorkflowId, WorkflowRunId,
    WorkspaceId,
};
