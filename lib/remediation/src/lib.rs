//! Dead-letter remediation for amber-relay.
//!
//! Failed executions land in a dead-letter queue. [`DlqPipeline`] classifies
//! each one with [`classify`], then discards it, alerts a human through
//! [`AlertService`], or re-injects the payload (after [`apply_fixes`] where
//! the classification asks for it).

pub mod alert;
pub mod classifier;
pub mod error;
pub mod fixes;
pub mod memory;
pub mod pipeline;

pub use alert::{
    Alert, AlertChannel, AlertDelivery, AlertPayload, AlertService, AlertSeverity, AlertSink,
    AlertType, LogAlertSink, WebhookDirectory,
};
pub use classifier::{ErrorCategory, ErrorClassification, Fix, RecoveryAction, classify};
pub use error::{AlertError, FailureStoreError, FixError, PipelineError, RequeueError};
pub use fixes::{RemediationResult, apply_fix, apply_fixes};
pub use memory::{InMemoryFailureStore, RecordingAlertSink, RecordingRequeue, RequeuedPayload};
pub use pipeline::{
    BatchItemFailure, BatchResponse, DlqConfig, DlqMessage, DlqMetrics, DlqPipeline, Disposition,
    FailureDetails, FailureRecord, FailureStatus, FailureStore, Requeue, receive_count,
};
