//! In-process implementations of the pipeline's collaborators.

use crate::alert::{Alert, AlertChannel, AlertSink};
use crate::error::{AlertError, FailureStoreError, RequeueError};
use crate::pipeline::{FailureRecord, FailureStore, Requeue};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keeps failure records in a vector.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFailureStore {
    records: Arc<Mutex<Vec<FailureRecord>>>,
}

impl InMemoryFailureStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records saved so far.
    #[must_use]
    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureStore for InMemoryFailureStore {
    async fn save(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// A payload handed to [`RecordingRequeue`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequeuedPayload {
    pub payload: Map<String, Value>,
    pub delay: Duration,
}

/// Records re-injected payloads, optionally failing every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingRequeue {
    requeued: Arc<Mutex<Vec<RequeuedPayload>>>,
    fail: bool,
}

impl RecordingRequeue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A requeue that rejects every payload.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Payloads accepted so far.
    #[must_use]
    pub fn requeued(&self) -> Vec<RequeuedPayload> {
        self.requeued.lock().unwrap().clone()
    }
}

#[async_trait]
impl Requeue for RecordingRequeue {
    async fn requeue(&self, payload: &Map<String, Value>, delay: Duration) -> Result<(), RequeueError> {
        if self.fail {
            return Err(RequeueError::PublishFailed {
                message: "queue unavailable".to_string(),
            });
        }
        self.requeued.lock().unwrap().push(RequeuedPayload {
            payload: payload.clone(),
            delay,
        });
        Ok(())
    }
}

/// Records delivered alerts for one channel.
#[derive(Debug, Clone)]
pub struct RecordingAlertSink {
    channel: AlertChannel,
    alerts: Arc<Mutex<Vec<Alert>>>,
    fail: bool,
}

impl RecordingAlertSink {
    #[must_use]
    pub fn new(channel: AlertChannel) -> Self {
        Self {
            channel,
            alerts: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        }
    }

    /// A sink whose deliveries always fail.
    #[must_use]
    pub fn failing(channel: AlertChannel) -> Self {
        Self {
            fail: true,
            ..Self::new(channel)
        }
    }

    /// Alerts delivered so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    fn channel(&self) -> AlertChannel {
        self.channel
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        if self.fail {
            return Err(AlertError::ChannelFailed {
                channel: self.channel,
                message: "delivery refused".to_string(),
            });
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
