//! Versioned envelope for lifecycle events on the wire.
//!
//! Subscribers (UI, billing) read the `version` before the payload so the
//! event shape can evolve without breaking older consumers.

use serde::{Deserialize, Serialize};

/// Current event schema version.
pub const CURRENT_VERSION: u32 = 1;

/// A payload tagged with its schema version and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    /// Payload kind, e.g. `run.completed`.
    pub kind: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps `payload` at the current version.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            kind: kind.into(),
            payload,
        }
    }

    /// Unwraps the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns true if this envelope uses the current version.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Deserializes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LifecycleEvent;
    use crate::run::RunStatus;
    use amber_relay_core::{WorkflowId, WorkflowRunId, WorkspaceId};
    use chrono::Utc;

    fn event() -> LifecycleEvent {
        LifecycleEvent {
            run_id: WorkflowRunId::new(),
            workflow_id: WorkflowId::new(),
            workspace_id: WorkspaceId::new(),
            status: RunStatus::Failed,
            error: Some("Circuit breaker open for ses.send_email".to_string()),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn lifecycle_event_wire_shape() {
        let envelope = Envelope::new("run.failed", event());
        let json = serde_json::to_value(&envelope).expect("to_value");

        assert_eq!(json["version"], CURRENT_VERSION);
        assert_eq!(json["kind"], "run.failed");
        assert_eq!(json["payload"]["status"], "failed");
        assert!(json["payload"]["run_id"].as_str().is_some());
    }

    #[test]
    fn decodes_published_bytes() {
        let envelope = Envelope::new("run.failed", event());
        let bytes = envelope.to_json_bytes().expect("serialize");
        let decoded: Envelope<LifecycleEvent> = Envelope::from_json_bytes(&bytes).expect("decode");

        assert!(decoded.is_current_version());
        assert_eq!(decoded.into_payload().status, RunStatus::Failed);
    }
}
