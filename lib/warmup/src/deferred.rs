//! Governed email sending with deferral.
//!
//! A send the governor denies is queued for later instead of being dropped.
//! Without a queue, the denial is a hard failure.

use crate::domain::extract_domain;
use crate::error::{QueueError, SendError, TransportError};
use crate::governor::SendRateGovernor;
use amber_relay_core::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// An email ready for the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    pub from_email: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reply_to: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// A denied email waiting on the deferred queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredEmail {
    #[serde(flatten)]
    pub email: OutboundEmail,
    /// Sending domain.
    pub domain: String,
    pub deferred_at: DateTime<Utc>,
    /// Times this email has been deferred.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

/// Delivers emails to the provider.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Sends `email`, returning the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError>;
}

/// Holds denied emails for a later attempt.
#[async_trait]
pub trait DeferredQueue: Send + Sync {
    /// Enqueues `email`, returning the queue's message id.
    async fn enqueue(&self, email: &DeferredEmail) -> Result<String, QueueError>;
}

/// What happened to an email handed to [`GovernedSender`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent { message_id: String },
    Deferred { message_id: String, domain: String },
}

/// Sends email through the warm-up governor.
pub struct GovernedSender {
    governor: Arc<SendRateGovernor>,
    transport: Arc<dyn EmailTransport>,
    queue: Option<Arc<dyn DeferredQueue>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for GovernedSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernedSender")
            .field("governor", &self.governor)
            .field("deferred_queue", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

impl GovernedSender {
    #[must_use]
    pub fn new(governor: Arc<SendRateGovernor>, transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            governor,
            transport,
            queue: None,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_deferred_queue(mut self, queue: Arc<dyn DeferredQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sends `email`, or defers it when the sender's domain is over its limit.
    ///
    /// # Errors
    ///
    /// Returns an error if a denied email cannot be deferred or the
    /// transport fails.
    #[instrument(skip(self, email), fields(from = %email.from_email))]
    pub async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, Report<SendError>> {
        Ok(self.send_attempt(email, 1).await?)
    }

    /// Retries an email taken off the deferred queue. A second denial puts
    /// it back with the attempt count raised.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    #[instrument(skip(self, deferred), fields(domain = %deferred.domain, attempt = deferred.attempt))]
    pub async fn redeliver(&self, deferred: &DeferredEmail) -> Result<SendOutcome, Report<SendError>> {
        Ok(self.send_attempt(&deferred.email, deferred.attempt + 1).await?)
    }

    /// Sends `email` without consulting the governor.
    ///
    /// For retries of a send that was already admitted and counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    #[instrument(skip(self, email), fields(from = %email.from_email))]
    pub async fn send_admitted(&self, email: &OutboundEmail) -> Result<SendOutcome, SendError> {
        let message_id = self.transport.send(email).await?;
        Ok(SendOutcome::Sent { message_id })
    }

    pub(crate) async fn send_attempt(
        &self,
        email: &OutboundEmail,
        attempt: u32,
    ) -> Result<SendOutcome, SendError> {
        let check = self.governor.check_limit(&email.from_email).await;
        if check.allowed {
            let message_id = self.transport.send(email).await?;
            return Ok(SendOutcome::Sent { message_id });
        }

        let domain = check
            .domain
            .or_else(|| extract_domain(&email.from_email))
            .unwrap_or_default();
        let Some(queue) = &self.queue else {
            error!(%domain, "send limit reached and no deferred queue is configured");
            return Err(SendError::NoDeferredQueue { domain });
        };
        let deferred = DeferredEmail {
            email: email.clone(),
            domain: domain.clone(),
            deferred_at: self.clock.now(),
            attempt,
        };
        let message_id = queue.enqueue(&deferred).await.map_err(|e| {
            error!(%domain, error = %e, "failed to defer email");
            SendError::DeferFailed {
                domain: domain.clone(),
                message: e.to_string(),
            }
        })?;
        info!(%domain, to = ?email.to, %message_id, attempt, "email deferred");
        Ok(SendOutcome::Deferred { message_id, domain })
    }
}
