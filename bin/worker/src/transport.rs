//! JetStream adapters for the remediation and warm-up seam traits.
//!
//! | Subject               | Stream          | Carries                          |
//! |-----------------------|-----------------|----------------------------------|
//! | `relay.dlq`           | `RELAY_DLQ`     | work messages that ran out of deliveries |
//! | `relay.deferred`      | `RELAY_DEFERRED`| emails held back by the warm-up governor |
//! | `relay.alerts.<chan>` | `RELAY_NOTIFY`  | alerts for external channels     |
//! | `relay.failures`      | `RELAY_NOTIFY`  | failure records for the dashboard |
//! | `relay.outbound`      | `RELAY_NOTIFY`  | emails handed to the provider    |
//! | `relay.warmup.feedback` | `RELAY_WARMUP` | provider bounce, complaint and engagement notifications |
//! | `relay.warmup.commands` | `RELAY_WARMUP` | warm-up start, pause, resume and cancel requests |
//!
//! DNS health lookups are NATS requests answered by a resolver service.

use amber_relay_core::WorkspaceId;
use amber_relay_remediation::{
    Alert, AlertChannel, AlertError, AlertSink, FailureRecord, FailureStore, FailureStoreError,
    Requeue, RequeueError,
};
use amber_relay_warmup::{
    CheckerError, DeferredEmail, DeferredQueue, DnsHealth, DnsHealthChecker, EmailTransport,
    OutboundEmail, QueueError, TransportError,
};
use amber_relay_workflow::Envelope;
use amber_relay_workflow::nats::{DELIVER_AT_HEADER, MSG_ID_HEADER, WORK_SUBJECT_PREFIX, work_subject};
use async_nats::HeaderMap;
use async_nats::jetstream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DLQ_SUBJECT: &str = "relay.dlq";
pub const DEFERRED_SUBJECT: &str = "relay.deferred";
pub const ALERTS_SUBJECT_PREFIX: &str = "relay.alerts";
pub const FAILURES_SUBJECT: &str = "relay.failures";
pub const OUTBOUND_SUBJECT: &str = "relay.outbound";

pub const WARMUP_SUBJECT_PREFIX: &str = "relay.warmup";
pub const WARMUP_FEEDBACK_SUBJECT: &str = "relay.warmup.feedback";
pub const WARMUP_COMMANDS_SUBJECT: &str = "relay.warmup.commands";

/// Handling attempts a republished work message has had.
pub const ATTEMPT_HEADER: &str = "Relay-Attempt";

pub const DLQ_STREAM: &str = "RELAY_DLQ";
pub const WARMUP_STREAM: &str = "RELAY_WARMUP";
pub const DEFERRED_STREAM: &str = "RELAY_DEFERRED";
pub const NOTIFY_STREAM: &str = "RELAY_NOTIFY";

/// Creates the streams the worker consumes from and publishes to, beyond
/// the work and events streams.
///
/// # Errors
///
/// Returns the broker's message if a stream cannot be created.
pub async fn ensure_streams(jetstream: &jetstream::Context) -> Result<(), String> {
    let streams = [
        (
            DLQ_STREAM,
            vec![DLQ_SUBJECT.to_string()],
            jetstream::stream::RetentionPolicy::WorkQueue,
        ),
        (
            DEFERRED_STREAM,
            vec![DEFERRED_SUBJECT.to_string()],
            jetstream::stream::RetentionPolicy::WorkQueue,
        ),
        (
            WARMUP_STREAM,
            vec![format!("{WARMUP_SUBJECT_PREFIX}.>")],
            jetstream::stream::RetentionPolicy::WorkQueue,
        ),
        (
            NOTIFY_STREAM,
            vec![
                format!("{ALERTS_SUBJECT_PREFIX}.>"),
                FAILURES_SUBJECT.to_string(),
                OUTBOUND_SUBJECT.to_string(),
            ],
            jetstream::stream::RetentionPolicy::Limits,
        ),
    ];

    for (name, subjects, retention) in streams {
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects,
                storage: jetstream::stream::StorageType::File,
                retention,
                ..Default::default()
            })
            .await
            .map_err(|e| format!("stream {name}: {e}"))?;
    }
    Ok(())
}

/// Publishes and waits for the broker's ack.
async fn publish(
    jetstream: &jetstream::Context,
    subject: String,
    headers: HeaderMap,
    bytes: Vec<u8>,
) -> Result<(), String> {
    jetstream
        .publish_with_headers(subject, headers, bytes.into())
        .await
        .map_err(|e| e.to_string())?
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn deliver_at_headers(deliver_at: DateTime<Utc>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(DELIVER_AT_HEADER, deliver_at.to_rfc3339().as_str());
    headers
}

/// Work subject for a re-injected payload. Payloads without a parseable
/// workspace land on `relay.work.unassigned`.
fn requeue_subject(payload: &Map<String, Value>) -> String {
    payload
        .get("workspace_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<WorkspaceId>().ok())
        .map_or_else(|| format!("{WORK_SUBJECT_PREFIX}.unassigned"), work_subject)
}

fn alert_subject(channel: AlertChannel) -> String {
    format!("{ALERTS_SUBJECT_PREFIX}.{}", channel.as_str())
}

/// Re-injects remediated payloads onto the work stream.
pub struct NatsRequeue {
    jetstream: Arc<jetstream::Context>,
}

impl NatsRequeue {
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl Requeue for NatsRequeue {
    async fn requeue(&self, payload: &Map<String, Value>, delay: Duration) -> Result<(), RequeueError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| RequeueError::SerializeFailed {
            message: e.to_string(),
        })?;
        let delay = chrono::Duration::from_std(delay).map_err(|e| RequeueError::SerializeFailed {
            message: e.to_string(),
        })?;
        let subject = requeue_subject(payload);
        debug!(%subject, delay_secs = delay.num_seconds(), "requeueing payload");

        publish(&self.jetstream, subject, deliver_at_headers(Utc::now() + delay), bytes)
            .await
            .map_err(|message| RequeueError::PublishFailed { message })
    }
}

/// Publishes alerts for one external channel; a downstream notifier delivers them.
pub struct NatsAlertSink {
    jetstream: Arc<jetstream::Context>,
    channel: AlertChannel,
}

impl NatsAlertSink {
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>, channel: AlertChannel) -> Self {
        Self { jetstream, channel }
    }
}

#[async_trait]
impl AlertSink for NatsAlertSink {
    fn channel(&self) -> AlertChannel {
        self.channel
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let failed = |message: String| AlertError::ChannelFailed {
            channel: self.channel,
            message,
        };
        let bytes = Envelope::new(format!("alert.{}", alert.alert_type), alert)
            .to_json_bytes()
            .map_err(|e| failed(e.to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, format!("{}:{}", alert.id, self.channel.as_str()).as_str());

        publish(&self.jetstream, alert_subject(self.channel), headers, bytes)
            .await
            .map_err(failed)
    }
}

/// Publishes failure records for the dashboard.
pub struct NatsFailureStore {
    jetstream: Arc<jetstream::Context>,
}

impl NatsFailureStore {
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl FailureStore for NatsFailureStore {
    async fn save(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        let bytes = Envelope::new("failure.recorded", record)
            .to_json_bytes()
            .map_err(|e| FailureStoreError::StorageFailed {
                message: e.to_string(),
            })?;
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, record.id.to_string().as_str());

        publish(&self.jetstream, FAILURES_SUBJECT.to_string(), headers, bytes)
            .await
            .map_err(|message| FailureStoreError::StorageFailed { message })
    }
}

/// Holds denied emails on the deferred stream until `retry_after` has passed.
pub struct NatsDeferredQueue {
    jetstream: Arc<jetstream::Context>,
    retry_after: chrono::Duration,
}

impl NatsDeferredQueue {
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>, retry_after: Duration) -> Self {
        Self {
            jetstream,
            retry_after: chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::hours(1)),
        }
    }
}

#[async_trait]
impl DeferredQueue for NatsDeferredQueue {
    async fn enqueue(&self, email: &DeferredEmail) -> Result<String, QueueError> {
        let bytes = serde_json::to_vec(email).map_err(|e| QueueError::SerializeFailed {
            message: e.to_string(),
        })?;
        let message_id = format!(
            "deferred:{}:{}:{}",
            email.domain,
            email.deferred_at.timestamp_millis(),
            email.attempt
        );
        let mut headers = deliver_at_headers(email.deferred_at + self.retry_after);
        headers.insert(MSG_ID_HEADER, message_id.as_str());

        publish(&self.jetstream, DEFERRED_SUBJECT.to_string(), headers, bytes)
            .await
            .map_err(|message| QueueError::PublishFailed { message })?;
        Ok(message_id)
    }
}

/// Hands outbound emails to the provider bridge over JetStream.
pub struct NatsEmailTransport {
    jetstream: Arc<jetstream::Context>,
}

impl NatsEmailTransport {
    #[must_use]
    pub fn new(jetstream: Arc<jetstream::Context>) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl EmailTransport for NatsEmailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let bytes = Envelope::new("email.outbound", email)
            .to_json_bytes()
            .map_err(|e| TransportError::Rejected {
                message: e.to_string(),
            })?;
        let message_id = ulid::Ulid::new().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, message_id.as_str());

        publish(&self.jetstream, OUTBOUND_SUBJECT.to_string(), headers, bytes)
            .await
            .map_err(|message| TransportError::Unavailable { message })?;
        Ok(message_id)
    }
}

/// Asks a resolver service for a domain's DNS health over NATS request/reply.
pub struct NatsDnsChecker {
    client: async_nats::Client,
    subject: String,
    timeout: Duration,
}

impl NatsDnsChecker {
    #[must_use]
    pub fn new(client: async_nats::Client, subject: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            subject: subject.into(),
            timeout,
        }
    }
}

fn dns_request(domain: &str) -> Vec<u8> {
    serde_json::json!({ "domain": domain }).to_string().into_bytes()
}

fn dns_reply(domain: &str, payload: &[u8]) -> Result<DnsHealth, CheckerError> {
    serde_json::from_slice(payload).map_err(|e| CheckerError::LookupFailed {
        domain: domain.to_string(),
        message: format!("invalid reply: {e}"),
    })
}

#[async_trait]
impl DnsHealthChecker for NatsDnsChecker {
    async fn check(&self, domain: &str) -> Result<DnsHealth, CheckerError> {
        let failed = |message: String| CheckerError::LookupFailed {
            domain: domain.to_string(),
            message,
        };
        let request = self
            .client
            .request(self.subject.clone(), dns_request(domain).into());
        let reply = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| failed(format!("no reply within {}s", self.timeout.as_secs())))?
            .map_err(|e| failed(e.to_string()))?;
        debug!(domain, "DNS health reply received");
        dns_reply(domain, &reply.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_relay_workflow::nats::remaining_delay;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn requeue_routes_by_workspace() {
        let ws = WorkspaceId::new();
        let payload = json!({ "workspace_id": ws.to_string(), "trigger_type": "form_submitted" });
        assert_eq!(
            requeue_subject(payload.as_object().unwrap()),
            format!("relay.work.{ws}")
        );
    }

    #[test]
    fn requeue_without_workspace_is_unassigned() {
        let payload = json!({ "workspace_id": "not-an-id" });
        assert_eq!(
            requeue_subject(payload.as_object().unwrap()),
            "relay.work.unassigned"
        );
        assert_eq!(requeue_subject(&Map::new()), "relay.work.unassigned");
    }

    #[test]
    fn alert_subjects_follow_channel_names() {
        assert_eq!(alert_subject(AlertChannel::Email), "relay.alerts.email");
        assert_eq!(alert_subject(AlertChannel::Webhook), "relay.alerts.webhook");
    }

    #[test]
    fn dns_replies_decode_into_health() {
        let reply = json!({
            "spf_valid": true,
            "dkim_enabled": true,
            "dmarc_valid": false,
            "mx_valid": true,
            "mx_hosts": ["mx1.mail.example.com"],
            "blacklist_listings": [],
            "errors": ["dmarc lookup timed out"],
        });
        let health = dns_reply("mail.example.com", reply.to_string().as_bytes()).unwrap();
        assert!(health.spf_valid);
        assert!(!health.dmarc_valid);
        assert_eq!(health.mx_hosts, vec!["mx1.mail.example.com".to_string()]);
        assert_eq!(health.errors.len(), 1);

        let err = dns_reply("mail.example.com", b"oops").unwrap_err();
        assert!(err.to_string().contains("mail.example.com"));
        assert_eq!(
            serde_json::from_slice::<Value>(&dns_request("mail.example.com")).unwrap()["domain"],
            "mail.example.com"
        );
    }

    #[test]
    fn warmup_subjects_share_the_stream_prefix() {
        for subject in [WARMUP_FEEDBACK_SUBJECT, WARMUP_COMMANDS_SUBJECT] {
            assert!(subject.starts_with(&format!("{WARMUP_SUBJECT_PREFIX}.")));
        }
    }

    #[test]
    fn deliver_at_header_is_read_back_by_consumers() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let headers = deliver_at_headers(now + chrono::Duration::minutes(2));
        assert_eq!(
            remaining_delay(Some(&headers), now),
            Some(Duration::from_secs(120))
        );
    }
}
