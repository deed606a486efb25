//! Provider feedback and warm-up control messages.
//!
//! SES reports bounces, complaints and deliveries (and, through event
//! publishing, opens and clicks) for every email it accepted. Each
//! notification is attributed to the sending domain in `mail.source` and
//! counted against that domain's warm-up. Notifications may arrive raw or
//! wrapped in an SNS envelope whose `Message` holds the JSON as a string.

use crate::domain::{StartWarmup, WarmupDomain, extract_domain};
use crate::error::WarmupError;
use crate::governor::SendRateGovernor;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::{debug, info, instrument};

/// Feedback kinds that move warm-up counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Bounce,
    Complaint,
    Delivery,
    Open,
    Click,
}

impl FeedbackKind {
    fn from_notification_type(value: &str) -> Option<Self> {
        match value {
            "Bounce" => Some(Self::Bounce),
            "Complaint" => Some(Self::Complaint),
            "Delivery" => Some(Self::Delivery),
            "Open" => Some(Self::Open),
            "Click" => Some(Self::Click),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bounce => "bounce",
            Self::Complaint => "complaint",
            Self::Delivery => "delivery",
            Self::Open => "open",
            Self::Click => "click",
        }
    }
}

impl fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An SES notification, reduced to what the warm-up needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackNotification {
    /// `notificationType` for SNS notifications, `eventType` for event publishing.
    #[serde(default, alias = "eventType")]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub mail: FeedbackMail,
    #[serde(default)]
    pub bounce: Option<BounceDetail>,
    #[serde(default)]
    pub complaint: Option<ComplaintDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FeedbackMail {
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceDetail {
    #[serde(default)]
    pub bounce_type: Option<String>,
    #[serde(default)]
    pub bounced_recipients: Vec<FeedbackRecipient>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintDetail {
    #[serde(default)]
    pub complaint_feedback_type: Option<String>,
    #[serde(default)]
    pub complained_recipients: Vec<FeedbackRecipient>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecipient {
    #[serde(default)]
    pub email_address: String,
}

impl FeedbackNotification {
    /// Parses a raw or SNS-wrapped notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload, or the wrapped message, is not JSON.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let value: JsonValue = serde_json::from_slice(payload)?;
        match value.get("Message").and_then(JsonValue::as_str) {
            Some(inner) => serde_json::from_str(inner),
            None => serde_json::from_value(value),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<FeedbackKind> {
        self.notification_type
            .as_deref()
            .and_then(FeedbackKind::from_notification_type)
    }

    /// Lowercased domain of `mail.source`.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        extract_domain(&self.mail.source)
    }

    fn recipients(&self) -> Vec<&str> {
        let bounced = self
            .bounce
            .iter()
            .flat_map(|b| b.bounced_recipients.iter());
        let complained = self
            .complaint
            .iter()
            .flat_map(|c| c.complained_recipients.iter());
        bounced
            .chain(complained)
            .map(|r| r.email_address.as_str())
            .collect()
    }
}

/// What [`SendRateGovernor::record_feedback`] did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Recorded {
        domain: String,
        kind: FeedbackKind,
        /// The warm-up crossed a threshold and was paused.
        auto_paused: bool,
    },
    /// Not a counted kind, or no usable sender domain.
    Ignored { reason: String },
}

impl SendRateGovernor {
    /// Counts one provider notification against its sending domain.
    #[instrument(skip(self, notification), fields(kind, domain))]
    pub async fn record_feedback(&self, notification: &FeedbackNotification) -> FeedbackOutcome {
        let Some(kind) = notification.kind() else {
            debug!(notification_type = ?notification.notification_type, "ignoring notification type");
            return FeedbackOutcome::Ignored {
                reason: format!(
                    "unhandled notification type {}",
                    notification.notification_type.as_deref().unwrap_or("<none>")
                ),
            };
        };
        let Some(domain) = notification.domain() else {
            return FeedbackOutcome::Ignored {
                reason: format!("no sender domain in '{}'", notification.mail.source),
            };
        };
        let span = tracing::Span::current();
        span.record("kind", kind.as_str());
        span.record("domain", domain.as_str());

        let auto_paused = match kind {
            FeedbackKind::Bounce => {
                info!(
                    %domain,
                    bounce_type = ?notification.bounce.as_ref().and_then(|b| b.bounce_type.as_deref()),
                    recipients = ?notification.recipients(),
                    "processing bounce"
                );
                self.record_bounce(&domain).await
            }
            FeedbackKind::Complaint => {
                info!(
                    %domain,
                    feedback_type = ?notification
                        .complaint
                        .as_ref()
                        .and_then(|c| c.complaint_feedback_type.as_deref()),
                    recipients = ?notification.recipients(),
                    "processing complaint"
                );
                self.record_complaint(&domain).await
            }
            FeedbackKind::Delivery => {
                self.record_delivery(&domain).await;
                false
            }
            FeedbackKind::Open => {
                self.record_open(&domain).await;
                false
            }
            FeedbackKind::Click => {
                self.record_click(&domain).await;
                false
            }
        };
        FeedbackOutcome::Recorded {
            domain,
            kind,
            auto_paused,
        }
    }

    /// Applies one warm-up control command.
    ///
    /// # Errors
    ///
    /// As the underlying [`start`](Self::start), [`pause`](Self::pause),
    /// [`resume`](Self::resume) or [`cancel`](Self::cancel).
    pub async fn apply(&self, command: WarmupCommand) -> Result<CommandOutcome, Report<WarmupError>> {
        match command {
            WarmupCommand::Start(request) => self.start(request).await.map(CommandOutcome::Updated),
            WarmupCommand::Pause { domain, reason } => {
                self.pause(&domain, &reason).await.map(CommandOutcome::Updated)
            }
            WarmupCommand::Resume { domain } => self.resume(&domain).await.map(CommandOutcome::Updated),
            WarmupCommand::Cancel { domain } => {
                let existed = self.cancel(&domain).await?;
                Ok(CommandOutcome::Cancelled { domain, existed })
            }
        }
    }
}

/// A warm-up control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WarmupCommand {
    Start(StartWarmup),
    Pause {
        domain: String,
        #[serde(default = "default_pause_reason")]
        reason: String,
    },
    Resume {
        domain: String,
    },
    Cancel {
        domain: String,
    },
}

fn default_pause_reason() -> String {
    "manual".to_string()
}

/// Result of [`SendRateGovernor::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Updated(WarmupDomain),
    Cancelled { domain: String, existed: bool },
}
