//! Dead-letter remediation pipeline.
//!
//! Every message in a batch reaches exactly one disposition:
//!
//! - acknowledged: discarded, alerted, or re-injected (possibly after fixes)
//! - left in the queue: remediation is disabled for the workspace, or
//!   handling failed
//!
//! [`DlqPipeline::handle_batch`] reports the second group back to the
//! transport as batch item failures so only those are redelivered.

use crate::alert::{Alert, AlertPayload, AlertService, AlertType};
use crate::classifier::{ErrorCategory, ErrorClassification, RecoveryAction, classify};
use crate::error::{AlertError, FailureStoreError, PipelineError, RequeueError};
use crate::fixes::apply_fixes;
use amber_relay_core::{Clock, FailureRecordId, FeatureFlags, Flag, SystemClock, WorkspaceId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Transport-provided delivery counter.
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";
/// Delivery counter set by producers that count their own retries.
pub const RETRY_COUNT_ATTRIBUTE: &str = "RetryCount";
pub const ERROR_MESSAGE_ATTRIBUTE: &str = "ErrorMessage";
pub const ERROR_CODE_ATTRIBUTE: &str = "ErrorCode";

const PREVIEW_CHARS: usize = 1000;

/// One dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub message_id: String,
    /// JSON body: the original trigger payload plus error metadata.
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl DlqMessage {
    #[must_use]
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Where a message is in its failure lifecycle on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Pending,
    Resolved,
    Ignored,
}

/// A failure surfaced for manual follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: FailureRecordId,
    pub workspace_id: String,
    pub error_type: ErrorCategory,
    pub error_code: Option<String>,
    pub reason: String,
    pub classification_reason: String,
    pub provider: Option<String>,
    pub trigger_type: Option<String>,
    pub contact_id: Option<String>,
    pub workflow_id: Option<String>,
    /// The start of the serialized payload.
    pub message_preview: String,
    pub status: FailureStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Persists failure records.
#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn save(&self, record: &FailureRecord) -> Result<(), FailureStoreError>;
}

/// Re-injects a payload into the work queue after a delay.
#[async_trait]
pub trait Requeue: Send + Sync {
    async fn requeue(&self, payload: &Map<String, Value>, delay: Duration) -> Result<(), RequeueError>;
}

/// Tunables for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqConfig {
    /// Upper bound on any re-injection delay; the delay queue's maximum.
    pub max_delay: Duration,
    /// Delay after fixes were applied.
    pub fix_delay: Duration,
    /// Delay after marking credentials for refresh.
    pub refresh_delay: Duration,
    /// Jitter added to backoff delays, as a fraction range.
    pub jitter: (f64, f64),
    /// How long failure records are kept.
    pub failure_retention_days: i64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(900),
            fix_delay: Duration::from_secs(10),
            refresh_delay: Duration::from_secs(30),
            jitter: (0.1, 0.2),
            failure_retention_days: 30,
        }
    }
}

/// What happened to a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The body was not a JSON object; dropped.
    Malformed,
    /// Dropped on purpose.
    Discarded,
    /// A human was alerted.
    Alerted { reason: String },
    /// Re-injected, possibly after fixes or a credential refresh mark.
    Requeued { action: RecoveryAction, delay: Duration },
    /// Remediation is off for the workspace; left in the queue.
    Skipped,
}

impl Disposition {
    /// Returns true if the message should be removed from the DLQ.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

/// Counters since start (or the last reset).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMetrics {
    pub processed: u64,
    pub discarded: u64,
    pub requeued: u64,
    pub fixed: u64,
    pub refreshed: u64,
    pub alerted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub by_category: HashMap<String, u64>,
    pub by_action: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Messages the transport should redeliver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

/// Error context pulled out of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureDetails {
    pub error_message: String,
    pub error_code: Option<String>,
    pub provider: Option<String>,
    pub workspace_id: Option<String>,
    pub trigger_type: Option<String>,
    pub contact_id: Option<String>,
    pub workflow_id: Option<String>,
}

impl FailureDetails {
    /// Extracts error context from a parsed body and its attributes.
    #[must_use]
    pub fn extract(body: &Map<String, Value>, message: &DlqMessage) -> Self {
        Self {
            error_message: extract_error_message(body, message),
            error_code: extract_error_code(body, message),
            provider: extract_provider(body),
            workspace_id: string_field(body, "workspace_id"),
            trigger_type: string_field(body, "trigger_type"),
            contact_id: string_field(body, "contact_id"),
            workflow_id: string_field(body, "workflow_id"),
        }
    }
}

fn string_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_error_message(body: &Map<String, Value>, message: &DlqMessage) -> String {
    match body.get("error") {
        Some(Value::String(s)) => return s.clone(),
        Some(Value::Object(obj)) => {
            return ["message", "Error"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map_or_else(|| Value::Object(obj.clone()).to_string(), str::to_string);
        }
        _ => {}
    }
    if let Some(attr) = message.attribute(ERROR_MESSAGE_ATTRIBUTE) {
        return attr.to_string();
    }
    if let Some(text) = string_field(body, "error_message") {
        return text;
    }
    match body.get("exception") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| Value::Object(obj.clone()).to_string(), str::to_string),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Later sources override earlier ones: `code`, `error_code`, `error.code`,
/// then the `ErrorCode` attribute.
fn extract_error_code(body: &Map<String, Value>, message: &DlqMessage) -> Option<String> {
    let nested = body
        .get("error")
        .and_then(Value::as_object)
        .and_then(|e| string_field(e, "code"));
    message
        .attribute(ERROR_CODE_ATTRIBUTE)
        .map(str::to_string)
        .or(nested)
        .or_else(|| string_field(body, "error_code"))
        .or_else(|| string_field(body, "code"))
}

fn extract_provider(body: &Map<String, Value>) -> Option<String> {
    if let Some(provider) = string_field(body, "provider").or_else(|| string_field(body, "provider_id")) {
        return Some(provider);
    }

    let trigger_type = string_field(body, "trigger_type").unwrap_or_default().to_lowercase();
    if trigger_type.contains("sms") {
        return Some("twilio".to_string());
    }
    if trigger_type.contains("email") {
        return Some("ses".to_string());
    }

    let node_type = string_field(body, "node_type").unwrap_or_default();
    if node_type.contains("send_sms") {
        Some("twilio".to_string())
    } else if node_type.contains("send_email") {
        Some("ses".to_string())
    } else if node_type.starts_with("ai_") {
        Some("bedrock".to_string())
    } else {
        None
    }
}

/// Delivery attempts so far: transport counter, then producer counter, then
/// the body's own `_retry_count`.
#[must_use]
pub fn receive_count(message: &DlqMessage, body: &Map<String, Value>) -> u32 {
    [RECEIVE_COUNT_ATTRIBUTE, RETRY_COUNT_ATTRIBUTE]
        .iter()
        .find_map(|key| message.attribute(key).and_then(|v| v.trim().parse().ok()))
        .or_else(|| match body.get("_retry_count")? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(0)
}

/// Classifies dead-lettered messages and acts on the verdict.
pub struct DlqPipeline {
    flags: Arc<FeatureFlags>,
    requeue: Arc<dyn Requeue>,
    alerts: Arc<AlertService>,
    failures: Arc<dyn FailureStore>,
    clock: Arc<dyn Clock>,
    config: DlqConfig,
    rng: Mutex<StdRng>,
    metrics: Mutex<DlqMetrics>,
}

impl DlqPipeline {
    #[must_use]
    pub fn new(
        flags: Arc<FeatureFlags>,
        requeue: Arc<dyn Requeue>,
        alerts: Arc<AlertService>,
        failures: Arc<dyn FailureStore>,
    ) -> Self {
        Self {
            flags,
            requeue,
            alerts,
            failures,
            clock: Arc::new(SystemClock),
            config: DlqConfig::default(),
            rng: Mutex::new(StdRng::from_entropy()),
            metrics: Mutex::new(DlqMetrics::default()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: DlqConfig) -> Self {
        self.config = config;
        self
    }

    /// Seeds the jitter RNG for reproducible delays.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
        self
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> DlqMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap() = DlqMetrics::default();
    }

    /// `min(max_delay, base * 2^count * (1 + j))` with `j` drawn from the
    /// jitter range.
    #[must_use]
    pub fn backoff_delay(&self, base_seconds: u64, count: u32) -> Duration {
        let (low, high) = self.config.jitter;
        let jitter = if high > low {
            self.rng.lock().unwrap().gen_range(low..=high)
        } else {
            low
        };
        let raw = base_seconds as f64 * 2f64.powi(count.min(30) as i32) * (1.0 + jitter);
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs(capped.floor() as u64)
    }

    /// Handles a batch; one message's failure never stops the rest.
    pub async fn handle_batch(&self, messages: &[DlqMessage]) -> BatchResponse {
        info!(count = messages.len(), "processing DLQ batch");
        let mut response = BatchResponse::default();

        for message in messages {
            match self.handle_message(message).await {
                Ok(disposition) if disposition.is_acknowledged() => {}
                Ok(_) => response.batch_item_failures.push(BatchItemFailure {
                    item_identifier: message.message_id.clone(),
                }),
                Err(err) => {
                    error!(message_id = %message.message_id, error = %err, "failed to process DLQ message");
                    self.metrics.lock().unwrap().errors += 1;
                    response.batch_item_failures.push(BatchItemFailure {
                        item_identifier: message.message_id.clone(),
                    });
                }
            }
        }

        let metrics = self.metrics();
        info!(
            processed = metrics.processed,
            requeued = metrics.requeued,
            fixed = metrics.fixed,
            alerted = metrics.alerted,
            discarded = metrics.discarded,
            errors = metrics.errors,
            unacknowledged = response.batch_item_failures.len(),
            "DLQ batch complete"
        );
        response
    }

    /// Handles one message.
    ///
    /// # Errors
    ///
    /// Returns an error if re-injection fails or an alert could not be
    /// delivered on any channel. The message must then stay in the queue.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn handle_message(&self, message: &DlqMessage) -> Result<Disposition, Report<PipelineError>> {
        self.metrics.lock().unwrap().processed += 1;

        let body = match serde_json::from_str::<Value>(&message.body) {
            Ok(Value::Object(body)) => body,
            Ok(_) | Err(_) => {
                error!("DLQ message body is not a JSON object");
                self.metrics.lock().unwrap().discarded += 1;
                return Ok(Disposition::Malformed);
            }
        };

        let details = FailureDetails::extract(&body, message);
        let workspace = details
            .workspace_id
            .as_deref()
            .and_then(|id| id.parse::<WorkspaceId>().ok());

        if let Some(ws) = workspace {
            if !self.flags.is_enabled(Flag::EnableDlqRemediation, ws) {
                info!(workspace_id = %ws, "DLQ remediation disabled");
                self.metrics.lock().unwrap().skipped += 1;
                return Ok(Disposition::Skipped);
            }
        }

        let count = receive_count(message, &body);
        let classification = classify(
            &details.error_message,
            details.error_code.as_deref(),
            details.provider.as_deref(),
        );

        {
            let mut metrics = self.metrics.lock().unwrap();
            *metrics
                .by_category
                .entry(classification.category.as_str().to_string())
                .or_default() += 1;
            *metrics
                .by_action
                .entry(classification.action.as_str().to_string())
                .or_default() += 1;
        }

        info!(
            category = %classification.category,
            action = %classification.action,
            confidence = classification.confidence,
            reason = %classification.reason,
            receive_count = count,
            "error classified"
        );

        // Only retrying actions spend the retry budget. Discard and alert
        // verdicts stand on their own whatever the count.
        if classification.action.is_retry() && count >= classification.max_retries {
            warn!(
                receive_count = count,
                max_retries = classification.max_retries,
                "max retries exceeded"
            );
            return self
                .alert(AlertType::DlqThreshold, "Max retries exceeded", &body, &details, &classification)
                .await;
        }

        let auto_retry = workspace.is_none_or(|ws| self.flags.is_enabled(Flag::EnableAutoRetry, ws));
        if classification.action.is_retry() && !auto_retry {
            return self
                .alert(
                    alert_type_for(&classification),
                    "Automatic retry disabled",
                    &body,
                    &details,
                    &classification,
                )
                .await;
        }

        match classification.action {
            RecoveryAction::Discard => {
                info!(reason = %classification.reason, "discarding message");
                self.metrics.lock().unwrap().discarded += 1;
                Ok(Disposition::Discarded)
            }
            RecoveryAction::Alert => {
                let reason = classification.reason.clone();
                self.alert(alert_type_for(&classification), &reason, &body, &details, &classification)
                    .await
            }
            RecoveryAction::Retry | RecoveryAction::RetryWithBackoff => {
                let delay = self.backoff_delay(classification.retry_delay_seconds, count);
                self.reinject(body, count, delay).await?;
                self.metrics.lock().unwrap().requeued += 1;
                Ok(Disposition::Requeued {
                    action: classification.action,
                    delay,
                })
            }
            RecoveryAction::FixAndRetry | RecoveryAction::ReduceAndRetry => {
                let result = apply_fixes(&body, &classification.fixes, details.provider.as_deref());
                if !result.is_actionable() {
                    let failed: Vec<String> = result
                        .fixes_failed
                        .iter()
                        .map(|(fix, err)| format!("{fix}: {err}"))
                        .collect();
                    warn!(?failed, "fixes failed");
                    return self
                        .alert(alert_type_for(&classification), "Auto-fix failed", &body, &details, &classification)
                        .await;
                }
                debug!(changes = ?result.changes, "fixes applied");
                let delay = self.config.fix_delay;
                self.reinject(result.payload, count, delay).await?;
                {
                    let mut metrics = self.metrics.lock().unwrap();
                    metrics.fixed += 1;
                    metrics.requeued += 1;
                }
                Ok(Disposition::Requeued {
                    action: classification.action,
                    delay,
                })
            }
            RecoveryAction::RefreshAndRetry => {
                let mut body = body;
                body.insert("_refresh_credentials".to_string(), Value::Bool(true));
                let delay = self.config.refresh_delay;
                self.reinject(body, count, delay).await?;
                {
                    let mut metrics = self.metrics.lock().unwrap();
                    metrics.refreshed += 1;
                    metrics.requeued += 1;
                }
                Ok(Disposition::Requeued {
                    action: classification.action,
                    delay,
                })
            }
        }
    }

    async fn reinject(
        &self,
        mut payload: Map<String, Value>,
        count: u32,
        delay: Duration,
    ) -> Result<(), Report<PipelineError>> {
        payload.insert("_retry_count".to_string(), Value::from(count + 1));
        payload.insert(
            "_retried_at".to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        let delay = delay.min(self.config.max_delay);
        self.requeue
            .requeue(&payload, delay)
            .await
            .map_err(PipelineError::from)?;
        info!(delay_secs = delay.as_secs(), retry_count = count + 1, "message requeued");
        Ok(())
    }

    async fn alert(
        &self,
        alert_type: AlertType,
        reason: &str,
        body: &Map<String, Value>,
        details: &FailureDetails,
        classification: &ErrorClassification,
    ) -> Result<Disposition, Report<PipelineError>> {
        let now = self.clock.now();
        let workspace_id = details
            .workspace_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        let record = FailureRecord {
            id: FailureRecordId::new(),
            workspace_id: workspace_id.clone(),
            error_type: classification.category,
            error_code: classification.error_code.clone(),
            reason: reason.to_string(),
            classification_reason: classification.reason.clone(),
            provider: classification.provider.clone(),
            trigger_type: details.trigger_type.clone(),
            contact_id: details.contact_id.clone(),
            workflow_id: details.workflow_id.clone(),
            message_preview: Value::Object(body.clone())
                .to_string()
                .chars()
                .take(PREVIEW_CHARS)
                .collect(),
            status: FailureStatus::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::days(self.config.failure_retention_days),
        };
        if let Err(err) = self.failures.save(&record).await {
            warn!(error = %err, "failed to store failure record");
        }

        let payload = AlertPayload {
            workspace_id: workspace_id.clone(),
            error_type: classification.category.as_str().to_string(),
            error_code: classification.error_code.clone(),
            reason: reason.to_string(),
            classification_reason: classification.reason.clone(),
            provider: classification.provider.clone(),
            trigger_type: details.trigger_type.clone(),
            contact_id: details.contact_id.clone(),
            timestamp: now,
        };
        let title = format!("Workflow error: {workspace_id}");
        let message = if details.error_message.is_empty() {
            reason.to_string()
        } else {
            format!("{reason}: {}", details.error_message)
        };

        let alert = Alert::new(alert_type, title, message, payload);
        let attempted = self.alerts.channels_for(&alert).len();
        self.alerts.send(alert).await.map_err(|report| {
            warn!(error = %report, "alert not delivered");
            PipelineError::from(AlertError::AllChannelsFailed { attempted })
        })?;

        self.metrics.lock().unwrap().alerted += 1;
        Ok(Disposition::Alerted {
            reason: reason.to_string(),
        })
    }
}

fn alert_type_for(classification: &ErrorClassification) -> AlertType {
    match (classification.category, classification.action) {
        (ErrorCategory::Configuration, _) => AlertType::CredentialExpired,
        (ErrorCategory::Transient, RecoveryAction::RetryWithBackoff) => AlertType::QuotaExceeded,
        (ErrorCategory::ProviderError, _) => AlertType::ProviderError,
        _ => AlertType::WorkflowFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertChannel;
    use crate::memory::{InMemoryFailureStore, RecordingAlertSink, RecordingRequeue};
    use amber_relay_core::{FlagConfig, ManualClock};
    use chrono::TimeZone;
    use serde_json::json;

    struct Harness {
        pipeline: DlqPipeline,
        requeue: RecordingRequeue,
        in_app: RecordingAlertSink,
        failures: InMemoryFailureStore,
    }

    fn harness_with(flags: FeatureFlags, requeue: RecordingRequeue) -> Harness {
        let in_app = RecordingAlertSink::new(AlertChannel::InApp);
        let email = RecordingAlertSink::new(AlertChannel::Email);
        let alerts = AlertService::new()
            .with_sink(Arc::new(in_app.clone()))
            .with_sink(Arc::new(email));
        let failures = InMemoryFailureStore::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let pipeline = DlqPipeline::new(
            Arc::new(flags),
            Arc::new(requeue.clone()),
            Arc::new(alerts),
            Arc::new(failures.clone()),
        )
        .with_clock(Arc::new(clock))
        .with_seed(7);
        Harness {
            pipeline,
            requeue,
            in_app,
            failures,
        }
    }

    fn harness() -> Harness {
        harness_with(FeatureFlags::all_enabled(), RecordingRequeue::new())
    }

    fn message(id: &str, body: Value) -> DlqMessage {
        DlqMessage::new(id, body.to_string())
    }

    #[test]
    fn extraction_prefers_explicit_fields() {
        let body = json!({
            "error": {"message": "Invalid 'To' Phone Number", "code": "21211"},
            "error_code": "99999",
            "trigger_type": "trigger_sms_received",
            "workspace_id": "ws_1",
        });
        let msg = message("m1", body.clone());
        let details = FailureDetails::extract(body.as_object().expect("object"), &msg);

        assert_eq!(details.error_message, "Invalid 'To' Phone Number");
        assert_eq!(details.error_code.as_deref(), Some("21211"));
        assert_eq!(details.provider.as_deref(), Some("twilio"));

        let msg = msg.with_attribute(ERROR_CODE_ATTRIBUTE, "30007");
        let details = FailureDetails::extract(body.as_object().expect("object"), &msg);
        assert_eq!(details.error_code.as_deref(), Some("30007"));
    }

    #[test]
    fn provider_inferred_from_node_type() {
        let body = json!({"node_type": "ai_respond", "exception": {"message": "boom"}});
        let msg = message("m1", body.clone());
        let details = FailureDetails::extract(body.as_object().expect("object"), &msg);
        assert_eq!(details.provider.as_deref(), Some("bedrock"));
        assert_eq!(details.error_message, "boom");
    }

    #[test]
    fn receive_count_sources() {
        let body = json!({"_retry_count": 2});
        let obj = body.as_object().expect("object");
        let msg = message("m1", body.clone());

        assert_eq!(receive_count(&msg, obj), 2);
        assert_eq!(receive_count(&msg.clone().with_attribute(RETRY_COUNT_ATTRIBUTE, "3"), obj), 3);
        assert_eq!(
            receive_count(&msg.with_attribute(RECEIVE_COUNT_ATTRIBUTE, "4"), obj),
            4
        );
        assert_eq!(receive_count(&message("m2", json!({})), &Map::new()), 0);
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        let h = harness();
        for count in 0..4 {
            let delay = h.pipeline.backoff_delay(60, count).as_secs();
            let base = 60 * 2u64.pow(count);
            let lower = (base as f64 * 1.1).floor() as u64;
            let upper = (base as f64 * 1.2).floor() as u64;
            assert!(
                delay >= lower.min(900) && delay <= upper.min(900),
                "count {count}: {delay}"
            );
        }
        assert_eq!(h.pipeline.backoff_delay(60, 10).as_secs(), 900);
    }

    #[tokio::test]
    async fn invalid_json_is_acknowledged() {
        let h = harness();
        let response = h
            .pipeline
            .handle_batch(&[DlqMessage::new("m1", "{not json")])
            .await;
        assert!(response.batch_item_failures.is_empty());
        assert_eq!(h.pipeline.metrics().discarded, 1);
    }

    #[tokio::test]
    async fn disabled_workspace_is_left_in_queue() {
        let ws = WorkspaceId::new();
        let mut config = FlagConfig::on();
        config.disabled_workspaces.insert(ws);
        let flags = FeatureFlags::all_enabled().with(Flag::EnableDlqRemediation, config);
        let h = harness_with(flags, RecordingRequeue::new());

        let response = h
            .pipeline
            .handle_batch(&[message("m1", json!({"workspace_id": ws.to_string(), "error": "timeout"}))])
            .await;

        assert_eq!(
            response.batch_item_failures,
            vec![BatchItemFailure {
                item_identifier: "m1".to_string()
            }]
        );
        assert_eq!(h.pipeline.metrics().skipped, 1);
        assert!(h.requeue.requeued().is_empty());
    }

    #[tokio::test]
    async fn max_retries_escalates_to_alert() {
        let h = harness();
        let msg = message("m1", json!({"workspace_id": "ws_1", "error": "Rate limit exceeded"}))
            .with_attribute(RECEIVE_COUNT_ATTRIBUTE, "5");

        let disposition = h.pipeline.handle_message(&msg).await.expect("handled");

        assert_eq!(
            disposition,
            Disposition::Alerted {
                reason: "Max retries exceeded".to_string()
            }
        );
        let alerts = h.in_app.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::DlqThreshold);
        assert_eq!(alerts[0].payload.reason, "Max retries exceeded");

        let records = h.failures.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, FailureStatus::Pending);
        assert_eq!((records[0].expires_at - records[0].created_at).num_days(), 30);
        assert!(h.requeue.requeued().is_empty());
    }

    #[tokio::test]
    async fn permanent_twilio_rejection_is_discarded_on_any_trip() {
        let h = harness();
        let body = json!({
            "workspace_id": "ws_1",
            "provider": "twilio",
            "error_code": "21211",
            "error": "Invalid 'To' Phone Number",
        });

        for count in ["0", "3"] {
            let msg = message("m1", body.clone()).with_attribute(RETRY_COUNT_ATTRIBUTE, count);
            let disposition = h.pipeline.handle_message(&msg).await.expect("handled");
            assert_eq!(disposition, Disposition::Discarded, "retry count {count}");
        }
        assert!(h.in_app.alerts().is_empty());
        assert!(h.failures.records().is_empty());
        assert!(h.requeue.requeued().is_empty());
    }

    #[tokio::test]
    async fn first_trip_of_single_retry_error_is_retried() {
        let h = harness();
        let body = json!({"workspace_id": "ws_1", "error": "OAuth token expired"});
        let msg = message("m1", body).with_attribute(RETRY_COUNT_ATTRIBUTE, "0");

        let disposition = h.pipeline.handle_message(&msg).await.expect("handled");

        assert!(matches!(disposition, Disposition::Requeued { .. }));
        assert_eq!(h.requeue.requeued()[0].payload["_retry_count"], 1);
    }

    #[tokio::test]
    async fn transient_error_is_requeued_with_backoff() {
        let h = harness();
        let msg = message(
            "m1",
            json!({"workspace_id": "ws_1", "error": "Rate limit exceeded", "trigger_type": "webhook"}),
        )
        .with_attribute(RECEIVE_COUNT_ATTRIBUTE, "1");

        let disposition = h.pipeline.handle_message(&msg).await.expect("handled");
        let Disposition::Requeued { action, delay } = disposition else {
            panic!("expected requeue, got {disposition:?}");
        };
        assert_eq!(action, RecoveryAction::RetryWithBackoff);
        assert!((132..=144).contains(&delay.as_secs()), "delay {delay:?}");

        let requeued = h.requeue.requeued();
        assert_eq!(requeued[0].payload["_retry_count"], 2);
        assert_eq!(requeued[0].payload["_retried_at"], "2024-06-01T12:00:00+00:00");
        assert_eq!(requeued[0].payload["trigger_type"], "webhook");
    }

    #[tokio::test]
    async fn fixable_payload_is_fixed_and_requeued() {
        let h = harness();
        let body = json!({
            "workspace_id": "ws_1",
            "provider": "twilio",
            "error_code": "21617",
            "error": "The concatenated message body exceeds the 1600 character limit",
            "body": "x".repeat(2000),
        });

        let disposition = h.pipeline.handle_message(&message("m1", body)).await.expect("handled");

        assert_eq!(
            disposition,
            Disposition::Requeued {
                action: RecoveryAction::FixAndRetry,
                delay: Duration::from_secs(10)
            }
        );
        let requeued = h.requeue.requeued();
        assert_eq!(requeued[0].payload["body"].as_str().map(str::len), Some(1600));
        assert_eq!(h.pipeline.metrics().fixed, 1);
    }

    #[tokio::test]
    async fn failed_fix_alerts() {
        let h = harness();
        let body = json!({"workspace_id": "ws_1", "error": "Invalid phone number", "to": "12"});

        let disposition = h.pipeline.handle_message(&message("m1", body)).await.expect("handled");

        assert_eq!(
            disposition,
            Disposition::Alerted {
                reason: "Auto-fix failed".to_string()
            }
        );
        assert!(h.requeue.requeued().is_empty());
    }

    #[tokio::test]
    async fn refresh_marks_credentials() {
        let h = harness();
        let body = json!({"workspace_id": "ws_1", "error": "OAuth token expired"});

        let disposition = h.pipeline.handle_message(&message("m1", body)).await.expect("handled");

        assert_eq!(
            disposition,
            Disposition::Requeued {
                action: RecoveryAction::RefreshAndRetry,
                delay: Duration::from_secs(30)
            }
        );
        assert_eq!(h.requeue.requeued()[0].payload["_refresh_credentials"], true);
        assert_eq!(h.pipeline.metrics().refreshed, 1);
    }

    #[tokio::test]
    async fn discard_is_acknowledged_without_side_effects() {
        let h = harness();
        let body = json!({"workspace_id": "ws_1", "error": "Recipient has opted out"});

        let response = h.pipeline.handle_batch(&[message("m1", body)]).await;

        assert!(response.batch_item_failures.is_empty());
        assert!(h.requeue.requeued().is_empty());
        assert!(h.in_app.alerts().is_empty());
        assert_eq!(h.pipeline.metrics().by_action.get("discard"), Some(&1));
    }

    #[tokio::test]
    async fn requeue_failure_leaves_message_and_batch_continues() {
        let h = harness_with(FeatureFlags::all_enabled(), RecordingRequeue::failing());
        let batch = [
            message("m1", json!({"workspace_id": "ws_1", "error": "connection reset"})),
            message("m2", json!({"workspace_id": "ws_1", "error": "unsubscribed"})),
        ];

        let response = h.pipeline.handle_batch(&batch).await;

        assert_eq!(
            response.batch_item_failures,
            vec![BatchItemFailure {
                item_identifier: "m1".to_string()
            }]
        );
        let metrics = h.pipeline.metrics();
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.discarded, 1);
        assert_eq!(metrics.processed, 2);
    }

    #[tokio::test]
    async fn auto_retry_flag_turns_retries_into_alerts() {
        let ws = WorkspaceId::new();
        let flags = FeatureFlags::all_enabled().with(Flag::EnableAutoRetry, FlagConfig::off());
        let h = harness_with(flags, RecordingRequeue::new());
        let body = json!({"workspace_id": ws.to_string(), "error": "Request timed out"});

        let disposition = h.pipeline.handle_message(&message("m1", body)).await.expect("handled");

        assert_eq!(
            disposition,
            Disposition::Alerted {
                reason: "Automatic retry disabled".to_string()
            }
        );
    }

    #[test]
    fn batch_response_wire_shape() {
        let response = BatchResponse {
            batch_item_failures: vec![BatchItemFailure {
                item_identifier: "m1".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&response).expect("serialize"),
            json!({"batchItemFailures": [{"itemIdentifier": "m1"}]})
        );
    }
}
