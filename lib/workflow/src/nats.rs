//! NATS JetStream transport for lifecycle messages and events.
//!
//! - Trigger and resume messages live on the work stream under
//!   `relay.work.<workspace_id>`.
//! - Delayed resumes are published with a `Nats-Msg-Id` header for
//!   broker-side dedup and a `Relay-Deliver-At` header. Consumers that
//!   receive a message early `nak` it with the remaining delay.
//! - Terminal lifecycle events go to `relay.run.<run_id>`.

use crate::envelope::Envelope;
use crate::error::{EventError, NatsError, QueueError};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::message::TriggerMessage;
use crate::queue::{DelayQueue, check_delay};
use amber_relay_core::{WorkflowRunId, WorkspaceId};
use async_nats::HeaderMap;
use async_nats::jetstream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::prelude::Report;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Subject prefix for work messages.
pub const WORK_SUBJECT_PREFIX: &str = "relay.work";

/// Subject prefix for lifecycle events.
pub const RUN_EVENTS_SUBJECT_PREFIX: &str = "relay.run";

/// Header carrying the earliest delivery time (RFC 3339).
pub const DELIVER_AT_HEADER: &str = "Relay-Deliver-At";

/// JetStream dedup header.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

const WORK_STREAM_NAME: &str = "RELAY_WORK";
const EVENTS_STREAM_NAME: &str = "RELAY_RUNS";

/// Dedup window; must cover the longest queue delay.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(20 * 60);

/// Connection and stream naming.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Work stream name (defaults to `RELAY_WORK`).
    pub work_stream_name: Option<String>,
    /// Lifecycle events stream name (defaults to `RELAY_RUNS`).
    pub events_stream_name: Option<String>,
}

impl NatsConfig {
    /// Creates a config with default stream names.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            work_stream_name: None,
            events_stream_name: None,
        }
    }

    /// Work stream name.
    #[must_use]
    pub fn work_stream(&self) -> &str {
        self.work_stream_name.as_deref().unwrap_or(WORK_STREAM_NAME)
    }

    /// Events stream name.
    #[must_use]
    pub fn events_stream(&self) -> &str {
        self.events_stream_name
            .as_deref()
            .unwrap_or(EVENTS_STREAM_NAME)
    }
}

/// Subject for a workspace's work messages.
#[must_use]
pub fn work_subject(workspace_id: WorkspaceId) -> String {
    format!("{WORK_SUBJECT_PREFIX}.{workspace_id}")
}

/// Subject for a run's lifecycle events.
#[must_use]
pub fn run_subject(run_id: WorkflowRunId) -> String {
    format!("{RUN_EVENTS_SUBJECT_PREFIX}.{run_id}")
}

/// How long a consumer should hold back a message carrying `headers`.
///
/// Returns `None` when the message is due or carries no usable deliver-at
/// header.
#[must_use]
pub fn remaining_delay(headers: Option<&HeaderMap>, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers?.get(DELIVER_AT_HEADER)?;
    let deliver_at = DateTime::parse_from_rfc3339(value.as_str()).ok()?;
    (deliver_at.with_timezone(&Utc) - now)
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

/// Connects and makes sure the work and events streams exist.
///
/// The core client is returned alongside the JetStream context for
/// request/reply traffic.
///
/// # Errors
///
/// Returns an error if connecting or creating a stream fails.
pub async fn connect(
    config: &NatsConfig,
) -> Result<(async_nats::Client, jetstream::Context), Report<NatsError>> {
    let client = async_nats::connect(&config.url)
        .await
        .map_err(|e| NatsError::ConnectionFailed {
            url: config.url.clone(),
            message: e.to_string(),
        })?;
    let jetstream = jetstream::new(client.clone());

    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.work_stream().to_string(),
            subjects: vec![format!("{WORK_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            duplicate_window: DUPLICATE_WINDOW,
            ..Default::default()
        })
        .await
        .map_err(|e| NatsError::StreamSetupFailed {
            stream: config.work_stream().to_string(),
            message: e.to_string(),
        })?;

    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.events_stream().to_string(),
            subjects: vec![format!("{RUN_EVENTS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        })
        .await
        .map_err(|e| NatsError::StreamSetupFailed {
            stream: config.events_stream().to_string(),
            message: e.to_string(),
        })?;

    Ok((client, jetstream))
}

/// Delay queue on the JetStream work stream.
pub struct NatsDelayQueue {
    jetstream: Arc<jetstream::Context>,
}

impl NatsDelayQueue {
    /// Creates a queue on an existing JetStream context.
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl DelayQueue for NatsDelayQueue {
    async fn enqueue(
        &self,
        message: &TriggerMessage,
        delay: Duration,
        dedup_key: &str,
    ) -> Result<(), QueueError> {
        check_delay(delay)?;
        let deliver_at = Utc::now()
            + chrono::Duration::from_std(delay).map_err(|e| QueueError::SerializeFailed {
                message: e.to_string(),
            })?;

        let bytes = serde_json::to_vec(message).map_err(|e| QueueError::SerializeFailed {
            message: e.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, dedup_key);
        headers.insert(DELIVER_AT_HEADER, deliver_at.to_rfc3339().as_str());

        self.jetstream
            .publish_with_headers(work_subject(message.workspace_id), headers, bytes.into())
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?;

        debug!(dedup_key, delay_secs = delay.as_secs(), "message enqueued with delay");
        Ok(())
    }
}

/// Publishes lifecycle events to JetStream.
pub struct NatsLifecycleEvents {
    jetstream: Arc<jetstream::Context>,
}

impl NatsLifecycleEvents {
    /// Creates a publisher on an existing JetStream context.
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl LifecycleEvents for NatsLifecycleEvents {
    async fn emit(&self, event: LifecycleEvent) -> Result<(), EventError> {
        let subject = run_subject(event.run_id);
        let kind = format!("run.{}", event.status);
        let bytes = Envelope::new(kind, event)
            .to_json_bytes()
            .map_err(|e| EventError::PublishFailed {
                message: format!("failed to serialize event: {e}"),
            })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| EventError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| EventError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn config_defaults_and_overrides() {
        let config = NatsConfig::new("nats://localhost:4222");
        assert_eq!(config.work_stream(), "RELAY_WORK");
        assert_eq!(config.events_stream(), "RELAY_RUNS");

        let config = NatsConfig {
            work_stream_name: Some("CUSTOM_WORK".to_string()),
            ..config
        };
        assert_eq!(config.work_stream(), "CUSTOM_WORK");
    }

    #[test]
    fn subjects() {
        let ws = WorkspaceId::new();
        assert_eq!(work_subject(ws), format!("relay.work.{ws}"));
        assert!(run_subject(WorkflowRunId::new()).starts_with("relay.run.run_"));
    }

    #[test]
    fn remaining_delay_from_header() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(DELIVER_AT_HEADER, "2024-06-01T12:05:00+00:00");

        assert_eq!(
            remaining_delay(Some(&headers), now),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            remaining_delay(Some(&headers), now + chrono::Duration::minutes(10)),
            None
        );
        assert_eq!(remaining_delay(None, now), None);
    }

    #[test]
    fn malformed_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(DELIVER_AT_HEADER, "soon");
        assert_eq!(remaining_delay(Some(&headers), Utc::now()), None);
    }
}
