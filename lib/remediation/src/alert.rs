//! Alert delivery for failures that need a human.
//!
//! An [`Alert`] carries the structured [`AlertPayload`] plus a title and
//! message. [`AlertService`] picks channels from the alert's severity and
//! hands the alert to one [`AlertSink`] per channel. A failing channel does
//! not stop the others; the send only fails when nothing was delivered.

use crate::error::AlertError;
use amber_relay_core::AlertId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    WorkflowFailure,
    ProviderError,
    CredentialExpired,
    QuotaExceeded,
    CircuitBreakerOpen,
    DlqThreshold,
    SystemError,
}

impl AlertType {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowFailure => "workflow_failure",
            Self::ProviderError => "provider_error",
            Self::CredentialExpired => "credential_expired",
            Self::QuotaExceeded => "quota_exceeded",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::DlqThreshold => "dlq_threshold",
            Self::SystemError => "system_error",
        }
    }

    /// Severity used when the caller does not pick one.
    #[must_use]
    pub const fn default_severity(&self) -> AlertSeverity {
        match self {
            Self::CredentialExpired | Self::SystemError => AlertSeverity::Critical,
            Self::QuotaExceeded | Self::CircuitBreakerOpen => AlertSeverity::Warning,
            Self::WorkflowFailure | Self::ProviderError | Self::DlqThreshold => AlertSeverity::Error,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Channels used for this severity, before any workspace webhook.
    #[must_use]
    pub fn default_channels(&self) -> Vec<AlertChannel> {
        match self {
            Self::Info => vec![AlertChannel::InApp],
            Self::Warning | Self::Error => vec![AlertChannel::InApp, AlertChannel::Email],
            Self::Critical => vec![AlertChannel::InApp, AlertChannel::Email, AlertChannel::Sns],
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an alert can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    InApp,
    Email,
    Sns,
    Webhook,
}

impl AlertChannel {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Email => "email",
            Self::Sns => "sns",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured details sent with every alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub workspace_id: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub reason: String,
    pub classification_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub payload: AlertPayload,
    /// Explicit channels; empty means "use the severity defaults".
    #[serde(default)]
    pub channels: Vec<AlertChannel>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Creates an alert with the type's default severity.
    #[must_use]
    pub fn new(
        alert_type: AlertType,
        title: impl Into<String>,
        message: impl Into<String>,
        payload: AlertPayload,
    ) -> Self {
        let created_at = payload.timestamp;
        Self {
            id: AlertId::new(),
            alert_type,
            severity: alert_type.default_severity(),
            title: title.into(),
            message: message.into(),
            payload,
            channels: Vec::new(),
            created_at,
        }
    }

    /// Overrides the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Pins the delivery channels.
    #[must_use]
    pub fn with_channels(mut self, channels: Vec<AlertChannel>) -> Self {
        self.channels = channels;
        self
    }

    /// Subject line used by email and pub/sub sinks.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("[{}] {}", self.severity.as_str().to_ascii_uppercase(), self.title)
    }
}

/// Delivers alerts over one channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// The channel this sink serves.
    fn channel(&self) -> AlertChannel;

    /// Delivers one alert.
    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Answers whether a workspace has an alert webhook configured.
pub trait WebhookDirectory: Send + Sync {
    fn has_webhook(&self, workspace_id: &str) -> bool;
}

/// Per-channel result of one send.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDelivery {
    pub alert_id: AlertId,
    pub delivered: Vec<AlertChannel>,
    pub failed: Vec<(AlertChannel, AlertError)>,
}

/// Routes alerts to channel sinks.
#[derive(Clone)]
pub struct AlertService {
    sinks: HashMap<AlertChannel, Arc<dyn AlertSink>>,
    webhooks: Option<Arc<dyn WebhookDirectory>>,
}

impl AlertService {
    /// Creates a service with no sinks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            webhooks: None,
        }
    }

    /// Registers a sink, replacing any sink for the same channel.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.insert(sink.channel(), sink);
        self
    }

    /// Adds webhook delivery for workspaces the directory knows about.
    #[must_use]
    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookDirectory>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Channels an alert will be sent to.
    #[must_use]
    pub fn channels_for(&self, alert: &Alert) -> Vec<AlertChannel> {
        if !alert.channels.is_empty() {
            return alert.channels.clone();
        }
        let mut channels = alert.severity.default_channels();
        let has_webhook = self
            .webhooks
            .as_ref()
            .is_some_and(|w| w.has_webhook(&alert.payload.workspace_id));
        if has_webhook {
            channels.push(AlertChannel::Webhook);
        }
        channels
    }

    /// Sends an alert on every selected channel.
    ///
    /// # Errors
    ///
    /// Returns an error only if no channel delivered the alert.
    #[instrument(
        skip(self, alert),
        fields(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            workspace_id = %alert.payload.workspace_id,
        )
    )]
    pub async fn send(&self, alert: Alert) -> Result<AlertDelivery, Report<AlertError>> {
        let channels = self.channels_for(&alert);
        let mut delivery = AlertDelivery {
            alert_id: alert.id,
            delivered: Vec::new(),
            failed: Vec::new(),
        };

        for channel in &channels {
            let result = match self.sinks.get(channel) {
                Some(sink) => sink.deliver(&alert).await,
                None => Err(AlertError::ChannelUnavailable { channel: *channel }),
            };
            match result {
                Ok(()) => delivery.delivered.push(*channel),
                Err(err) => {
                    warn!(%channel, error = %err, "alert channel failed");
                    delivery.failed.push((*channel, err));
                }
            }
        }

        if delivery.delivered.is_empty() {
            return Err(AlertError::AllChannelsFailed {
                attempted: channels.len(),
            }
            .into());
        }

        info!(delivered = ?delivery.delivered, "alert sent");
        Ok(delivery)
    }
}

impl Default for AlertService {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes alerts to the log. Serves as the in-app channel when no
/// persistent store is wired.
#[derive(Debug, Clone, Copy)]
pub struct LogAlertSink {
    channel: AlertChannel,
}

impl LogAlertSink {
    #[must_use]
    pub fn new(channel: AlertChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    fn channel(&self) -> AlertChannel {
        self.channel
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        warn!(
            alert_id = %alert.id,
            subject = %alert.subject(),
            message = %alert.message,
            error_type = %alert.payload.error_type,
            error_code = alert.payload.error_code.as_deref().unwrap_or(""),
            "alert raised"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordingAlertSink;
    use std::collections::HashSet;

    fn payload() -> AlertPayload {
        AlertPayload {
            workspace_id: "ws_1".to_string(),
            error_type: "permanent".to_string(),
            error_code: Some("30004".to_string()),
            reason: "Message blocked".to_string(),
            classification_reason: "Message blocked".to_string(),
            provider: Some("twilio".to_string()),
            trigger_type: None,
            contact_id: None,
            timestamp: Utc::now(),
        }
    }

    struct Webhooks(HashSet<String>);

    impl WebhookDirectory for Webhooks {
        fn has_webhook(&self, workspace_id: &str) -> bool {
            self.0.contains(workspace_id)
        }
    }

    #[test]
    fn default_severity_and_channels() {
        assert_eq!(AlertType::CredentialExpired.default_severity(), AlertSeverity::Critical);
        assert_eq!(AlertType::QuotaExceeded.default_severity(), AlertSeverity::Warning);
        assert_eq!(AlertType::DlqThreshold.default_severity(), AlertSeverity::Error);

        assert_eq!(AlertSeverity::Info.default_channels(), vec![AlertChannel::InApp]);
        assert_eq!(AlertSeverity::Critical.default_channels().len(), 3);
    }

    #[test]
    fn webhook_added_for_configured_workspace() {
        let service = AlertService::new()
            .with_webhooks(Arc::new(Webhooks(HashSet::from(["ws_1".to_string()]))));
        let alert = Alert::new(AlertType::ProviderError, "t", "m", payload());

        assert_eq!(
            service.channels_for(&alert),
            vec![AlertChannel::InApp, AlertChannel::Email, AlertChannel::Webhook]
        );

        let pinned = alert.with_channels(vec![AlertChannel::Sns]);
        assert_eq!(service.channels_for(&pinned), vec![AlertChannel::Sns]);
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_block_others() {
        let in_app = RecordingAlertSink::new(AlertChannel::InApp);
        let email = RecordingAlertSink::failing(AlertChannel::Email);
        let service = AlertService::new()
            .with_sink(Arc::new(in_app.clone()))
            .with_sink(Arc::new(email));

        let delivery = service
            .send(Alert::new(AlertType::WorkflowFailure, "t", "m", payload()))
            .await
            .expect("delivered in-app");

        assert_eq!(delivery.delivered, vec![AlertChannel::InApp]);
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(in_app.alerts().len(), 1);
    }

    #[tokio::test]
    async fn send_fails_when_nothing_delivered() {
        let service = AlertService::new();
        let err = service
            .send(Alert::new(AlertType::WorkflowFailure, "t", "m", payload()))
            .await
            .expect_err("no sinks");
        assert!(err.to_string().contains("failed on all 2 channels"));
    }

    #[test]
    fn payload_omits_missing_fields() {
        let json = serde_json::to_value(payload()).expect("serialize");
        assert_eq!(json["provider"], "twilio");
        assert!(json.get("trigger_type").is_none());
    }
}
