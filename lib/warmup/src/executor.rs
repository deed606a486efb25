//! `action_send_email` executor routed through the warm-up governor.

use crate::deferred::{GovernedSender, OutboundEmail, SendOutcome};
use crate::error::{SendError, TransportError};
use amber_relay_dispatch::{NodeExecutionError, NodeExecutionRequest, NodeExecutor, NodeResult};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Node type handled by [`SendEmailExecutor`].
pub const SEND_EMAIL_NODE_TYPE: &str = "action_send_email";

/// Sends the email described by the node configuration.
///
/// Reads `to`, `subject`, `from` (or `from_email`) and either `body`/`body_text`
/// or `body_html`; `cc`, `bcc`, `reply_to` and `tags` are optional. Address
/// fields take a string or a list of strings. A deferred send completes the
/// node with `status = "deferred"`.
#[derive(Debug)]
pub struct SendEmailExecutor {
    sender: Arc<GovernedSender>,
}

impl SendEmailExecutor {
    #[must_use]
    pub fn new(sender: Arc<GovernedSender>) -> Self {
        Self { sender }
    }

    fn email(config: &Map<String, JsonValue>) -> Result<OutboundEmail, NodeExecutionError> {
        let to = addresses(config.get("to"));
        if to.is_empty() {
            return Err(invalid("send_email node requires `to`"));
        }
        let subject = string(config, &["subject"])
            .ok_or_else(|| invalid("send_email node requires `subject`"))?;
        let from_email = string(config, &["from", "from_email"])
            .ok_or_else(|| invalid("send_email node requires `from`"))?;
        let body_text = string(config, &["body", "body_text"]);
        let body_html = string(config, &["body_html", "html"]);
        if body_text.is_none() && body_html.is_none() {
            return Err(invalid("send_email node requires a body"));
        }
        let tags: BTreeMap<String, String> = config
            .get("tags")
            .and_then(JsonValue::as_object)
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(OutboundEmail {
            to,
            cc: addresses(config.get("cc")),
            bcc: addresses(config.get("bcc")),
            subject,
            body_text,
            body_html,
            from_email,
            reply_to: addresses(config.get("reply_to")),
            tags,
        })
    }
}

fn invalid(message: &str) -> NodeExecutionError {
    NodeExecutionError::InvalidInput {
        message: message.to_string(),
    }
}

fn string(config: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| config.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn addresses(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Provider name reported on email transport failures.
pub const EMAIL_PROVIDER: &str = "ses";

#[async_trait]
impl NodeExecutor for SendEmailExecutor {
    // Only transport faults come back as `Err`, and those happen after the
    // governor admitted the send. A retry therefore reuses that admission.
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<NodeResult, NodeExecutionError> {
        let email = Self::email(&request.config)?;
        let sent = if request.is_first_attempt() {
            self.sender.send_attempt(&email, 1).await
        } else {
            self.sender.send_admitted(&email).await
        };
        match sent {
            Ok(SendOutcome::Sent { message_id }) => Ok(NodeResult::completed()
                .with_output_value("status", json!("sent"))
                .with_output_value("message_id", json!(message_id))
                .with_output_value("to", json!(email.to))),
            Ok(SendOutcome::Deferred { message_id, domain }) => Ok(NodeResult::completed()
                .with_output_value("status", json!("deferred"))
                .with_output_value("message_id", json!(message_id))
                .with_output_value("domain", json!(domain))),
            Err(SendError::Transport(e)) => Err(NodeExecutionError::Provider {
                provider: EMAIL_PROVIDER.to_string(),
                code: Some(transport_code(&e).to_string()),
                message: e.to_string(),
            }),
            Err(e @ (SendError::NoDeferredQueue { .. } | SendError::DeferFailed { .. })) => {
                let code = match &e {
                    SendError::NoDeferredQueue { .. } => "no_deferred_queue",
                    _ => "defer_failed",
                };
                Ok(NodeResult {
                    error_code: Some(code.to_string()),
                    provider: Some(EMAIL_PROVIDER.to_string()),
                    ..NodeResult::failed(e.to_string())
                })
            }
        }
    }
}

fn transport_code(error: &TransportError) -> &'static str {
    match error {
        TransportError::Rejected { .. } => "MessageRejected",
        TransportError::Unavailable { .. } => "ServiceUnavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StartWarmup;
    use crate::governor::SendRateGovernor;
    use crate::memory::{InMemoryWarmupStore, RecordingDeferredQueue, RecordingTransport};
    use crate::store::{CounterKind, WarmupStore};
    use amber_relay_core::{Clock, ManualClock, WorkspaceId};
    use chrono::{TimeZone, Utc};

    fn config(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    fn request(config: Map<String, JsonValue>) -> NodeExecutionRequest {
        NodeExecutionRequest::new(SEND_EMAIL_NODE_TYPE, "email-1", WorkspaceId::new())
            .with_config(config)
    }

    fn welcome() -> Map<String, JsonValue> {
        config(json!({
            "to": "lead@customer.test",
            "subject": "Welcome",
            "body": "Hello",
            "from": "Acme <hello@example.com>",
        }))
    }

    async fn executor(exhausted: bool, queue: Option<RecordingDeferredQueue>) -> SendEmailExecutor {
        executor_with(exhausted, queue, RecordingTransport::new()).await.0
    }

    async fn executor_with(
        exhausted: bool,
        queue: Option<RecordingDeferredQueue>,
        transport: RecordingTransport,
    ) -> (SendEmailExecutor, InMemoryWarmupStore) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let store = InMemoryWarmupStore::new().with_clock(Arc::new(clock.clone()));
        let governor = Arc::new(
            SendRateGovernor::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone())),
        );
        governor
            .start(StartWarmup::new(WorkspaceId::new(), "example.com"))
            .await
            .unwrap();
        if exhausted {
            for _ in 0..10 {
                store
                    .increment_daily("example.com", clock.now().date_naive(), CounterKind::Send)
                    .await
                    .unwrap();
            }
        }
        let mut sender = GovernedSender::new(governor, Arc::new(transport));
        if let Some(queue) = queue {
            sender = sender.with_deferred_queue(Arc::new(queue));
        }
        (SendEmailExecutor::new(Arc::new(sender)), store)
    }

    #[tokio::test]
    async fn sends_within_limit() {
        let executor = executor(false, None).await;

        let result = executor.execute(&request(welcome())).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output["status"], "sent");
        assert_eq!(result.output["to"], json!(["lead@customer.test"]));
    }

    #[tokio::test]
    async fn deferral_completes_the_node() {
        let queue = RecordingDeferredQueue::new();
        let executor = executor(true, Some(queue.clone())).await;

        let result = executor.execute(&request(welcome())).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output["status"], "deferred");
        assert_eq!(queue.deferred().len(), 1);
    }

    #[tokio::test]
    async fn deferral_without_queue_fails_the_node_without_retry() {
        let executor = executor(true, None).await;

        let result = executor.execute(&request(welcome())).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("no_deferred_queue"));
    }

    #[tokio::test]
    async fn failed_queue_fails_the_node_without_retry() {
        let executor = executor(true, Some(RecordingDeferredQueue::failing())).await;

        let result = executor.execute(&request(welcome())).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("defer_failed"));
    }

    #[tokio::test]
    async fn transport_failure_reports_provider_code() {
        let (executor, _) = executor_with(false, None, RecordingTransport::failing()).await;

        let err = executor.execute(&request(welcome())).await.unwrap_err();

        assert_eq!(
            err,
            NodeExecutionError::Provider {
                provider: "ses".to_string(),
                code: Some("ServiceUnavailable".to_string()),
                message: "email provider unavailable: connection reset".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn retried_send_counts_once_against_the_quota() {
        let (executor, store) = executor_with(false, None, RecordingTransport::failing_times(1)).await;
        let first = request(welcome());

        assert!(executor.execute(&first).await.is_err());
        let result = executor.execute(&first.for_attempt(1)).await.unwrap();

        assert_eq!(result.output["status"], "sent");
        let day = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap().date_naive();
        let today = store.daily_counter("example.com", day).await.unwrap();
        assert_eq!(today.send_count, 1);
    }

    #[tokio::test]
    async fn missing_recipient_is_invalid_input() {
        let executor = executor(false, None).await;
        let mut config = welcome();
        config.remove("to");

        let err = executor.execute(&request(config)).await.unwrap_err();

        assert!(matches!(err, NodeExecutionError::InvalidInput { .. }));
    }

    #[test]
    fn address_lists_accept_strings_and_arrays() {
        assert_eq!(
            addresses(Some(&json!("a@x.test, b@x.test"))),
            vec!["a@x.test".to_string(), "b@x.test".to_string()]
        );
        assert_eq!(addresses(Some(&json!(["c@x.test"]))), vec!["c@x.test".to_string()]);
        assert!(addresses(None).is_empty());
    }
}
