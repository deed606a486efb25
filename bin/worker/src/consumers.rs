//! Durable pull consumers for the work, dead-letter, deferred and warm-up
//! streams.
//!
//! Each loop acks a message once it has been handled. Messages carrying a
//! future `Relay-Deliver-At` header are nakked for the remaining time without
//! being handled, so holding a message back never counts as an attempt. Work
//! messages that fail are republished with a raised `Relay-Attempt` header
//! and a deliver-at time, and the original is acked.

use crate::config::NatsSettings;
use crate::error::WorkerError;
use crate::transport::{
    ATTEMPT_HEADER, DEFERRED_STREAM, DEFERRED_SUBJECT, DLQ_STREAM, DLQ_SUBJECT, WARMUP_COMMANDS_SUBJECT,
    WARMUP_FEEDBACK_SUBJECT, WARMUP_STREAM, WARMUP_SUBJECT_PREFIX,
};
use amber_relay_core::WorkflowRunId;
use amber_relay_remediation::pipeline::{
    ERROR_CODE_ATTRIBUTE, ERROR_MESSAGE_ATTRIBUTE, RETRY_COUNT_ATTRIBUTE,
};
use amber_relay_remediation::{DlqMessage, DlqPipeline};
use amber_relay_warmup::{
    DeferredEmail, FeedbackNotification, GovernedSender, SendRateGovernor, WarmupCommand, WarmupError,
};
use amber_relay_workflow::nats::{DELIVER_AT_HEADER, WORK_SUBJECT_PREFIX, remaining_delay};
use amber_relay_workflow::{
    DriveOutcome, HandleOutcome, MessageAction, NodeFailure, RunLifecycle, TriggerMessage,
};
use async_nats::HeaderMap;
use async_nats::jetstream::{self, AckKind};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rootcause::prelude::Report;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Body field counting trips through the dead-letter queue.
const RETRY_COUNT_FIELD: &str = "_retry_count";

/// Longest error text carried in a header.
const HEADER_ERROR_CHARS: usize = 512;

/// Publish attempts for a node failure before it is given up on.
const DEAD_LETTER_PUBLISH_ATTEMPTS: u32 = 3;

/// Subscribes a durable pull consumer to `filter_subject` on `stream_name`.
async fn pull(
    jetstream: &jetstream::Context,
    stream_name: &str,
    durable_name: String,
    filter_subject: String,
) -> Result<jetstream::consumer::pull::Stream, Report<WorkerError>> {
    let nats = |message: String| WorkerError::Nats { message };
    let stream = jetstream
        .get_stream(stream_name)
        .await
        .map_err(|e| nats(format!("stream {stream_name}: {e}")))?;
    let consumer = stream
        .get_or_create_consumer(
            &durable_name,
            jetstream::consumer::pull::Config {
                durable_name: Some(durable_name.clone()),
                filter_subject,
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| nats(format!("consumer {durable_name}: {e}")))?;
    Ok(consumer
        .messages()
        .await
        .map_err(|e| nats(format!("consumer {durable_name} messages: {e}")))?)
}

async fn ack(message: &jetstream::Message) {
    if let Err(e) = message.ack().await {
        warn!(subject = %message.subject, error = %e, "ack failed");
    }
}

async fn nak(message: &jetstream::Message, delay: Duration) {
    if let Err(e) = message.ack_with(AckKind::Nak(Some(delay))).await {
        warn!(subject = %message.subject, error = %e, "nak failed");
    }
}

async fn term(message: &jetstream::Message) {
    if let Err(e) = message.ack_with(AckKind::Term).await {
        warn!(subject = %message.subject, error = %e, "term failed");
    }
}

/// Naks `message` if its deliver-at time is still ahead. Returns true when
/// the message was held back.
async fn hold_if_early(message: &jetstream::Message) -> bool {
    match remaining_delay(message.headers.as_ref(), Utc::now()) {
        Some(delay) => {
            debug!(subject = %message.subject, delay_secs = delay.as_secs(), "message not yet due");
            nak(message, delay).await;
            true
        }
        None => false,
    }
}

/// Handling attempts a work message has had, counting this one.
fn attempt(headers: Option<&HeaderMap>) -> u32 {
    headers
        .and_then(|headers| headers.get(ATTEMPT_HEADER))
        .and_then(|value| value.as_str().trim().parse().ok())
        .unwrap_or(1)
}

/// Run id for a start message that arrived without one, derived from the
/// message's place in the stream so every redelivery gets the same run.
fn derived_run_id(published: DateTime<Utc>, stream_sequence: u64) -> WorkflowRunId {
    let millis = u64::try_from(published.timestamp_millis()).unwrap_or_default();
    WorkflowRunId::from_ulid(ulid::Ulid::from_parts(millis, u128::from(stream_sequence)))
}

fn published_at(message: &jetstream::Message) -> Option<(DateTime<Utc>, u64)> {
    let info = message.info().ok()?;
    let nanos = info.published.unix_timestamp_nanos();
    let published = DateTime::from_timestamp_nanos(i64::try_from(nanos).ok()?);
    Some((published, info.stream_sequence))
}

/// Sets `workflow_run_id` in a JSON object payload. Other payloads are
/// returned unchanged.
fn with_run_id(payload: &[u8], run_id: WorkflowRunId) -> Vec<u8> {
    let Ok(Value::Object(mut body)) = serde_json::from_slice::<Value>(payload) else {
        return payload.to_vec();
    };
    body.insert("workflow_run_id".to_string(), Value::String(run_id.to_string()));
    serde_json::to_vec(&body).unwrap_or_else(|_| payload.to_vec())
}

/// Single-line, bounded error text safe for a NATS header.
fn header_text(error: &str) -> String {
    error
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(HEADER_ERROR_CHARS)
        .collect()
}

/// Body for a dead-lettered work message: the original payload with the
/// error. `_retry_count` is left as the dead-letter pipeline last set it;
/// the pipeline raises it when it re-injects. Non-object payloads pass
/// through.
fn dead_letter_body(payload: &[u8], error: &str) -> (Vec<u8>, u32) {
    let Ok(Value::Object(mut body)) = serde_json::from_slice::<Value>(payload) else {
        return (payload.to_vec(), 0);
    };
    let count = retry_count(&body);
    body.insert("error".to_string(), Value::String(error.to_string()));
    body.insert(RETRY_COUNT_FIELD.to_string(), Value::from(count));
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| payload.to_vec());
    (bytes, count)
}

/// Body for a node that failed its run: a start message that re-runs the
/// workflow from the failed node, plus what the pipeline classifies on.
fn node_failure_body(
    failure: &NodeFailure,
    failed_run_id: Option<WorkflowRunId>,
    retry_count: u32,
) -> Result<Vec<u8>, serde_json::Error> {
    let Value::Object(mut body) = serde_json::to_value(&failure.restart)? else {
        return serde_json::to_vec(&failure.restart);
    };
    body.insert("error".to_string(), Value::String(failure.error.clone()));
    body.insert("node_id".to_string(), Value::String(failure.node_id.clone()));
    body.insert("node_type".to_string(), Value::String(failure.node_type.clone()));
    if let Some(code) = &failure.error_code {
        body.insert("error_code".to_string(), Value::String(code.clone()));
    }
    if let Some(provider) = &failure.provider {
        body.insert("provider".to_string(), Value::String(provider.clone()));
    }
    if let Some(run_id) = failed_run_id {
        body.insert("failed_run_id".to_string(), Value::String(run_id.to_string()));
    }
    body.insert(RETRY_COUNT_FIELD.to_string(), Value::from(retry_count));
    serde_json::to_vec(&body)
}

fn retry_count(body: &Map<String, Value>) -> u32 {
    body.get(RETRY_COUNT_FIELD)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn payload_retry_count(payload: &[u8]) -> u32 {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(body)) => retry_count(&body),
        _ => 0,
    }
}

fn dead_letter_headers(error: &str, error_code: Option<&str>, count: u32) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ERROR_MESSAGE_ATTRIBUTE, header_text(error).as_str());
    if let Some(code) = error_code {
        headers.insert(ERROR_CODE_ATTRIBUTE, header_text(code).as_str());
    }
    headers.insert(RETRY_COUNT_ATTRIBUTE, count.to_string().as_str());
    headers
}

/// Builds the pipeline's view of a message taken off the dead-letter stream.
fn dlq_message(id: String, payload: &[u8], headers: Option<&HeaderMap>) -> DlqMessage {
    let mut message = DlqMessage::new(id, String::from_utf8_lossy(payload));
    if let Some(headers) = headers {
        for key in [ERROR_MESSAGE_ATTRIBUTE, ERROR_CODE_ATTRIBUTE, RETRY_COUNT_ATTRIBUTE] {
            if let Some(value) = headers.get(key) {
                message = message.with_attribute(key, value.as_str());
            }
        }
    }
    message
}

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

async fn dead_letter(
    jetstream: &jetstream::Context,
    payload: &[u8],
    error: &str,
) -> Result<(), String> {
    let (bytes, count) = dead_letter_body(payload, error);
    publish(
        jetstream,
        DLQ_SUBJECT.to_string(),
        dead_letter_headers(error, None, count),
        bytes,
    )
    .await
}

/// Dead-letters a failed node. The run is already failed, so a redelivered
/// copy of the work message could not rebuild this; the publish is retried
/// in place instead.
async fn dead_letter_node_failure(
    jetstream: &jetstream::Context,
    failure: &NodeFailure,
    failed_run_id: Option<WorkflowRunId>,
    retry_count: u32,
) {
    let bytes = match node_failure_body(failure, failed_run_id, retry_count) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(node_id = %failure.node_id, error = %e, "failed to encode node failure");
            return;
        }
    };
    for publish_attempt in 1..=DEAD_LETTER_PUBLISH_ATTEMPTS {
        let headers = dead_letter_headers(&failure.error, failure.error_code.as_deref(), retry_count);
        match publish(jetstream, DLQ_SUBJECT.to_string(), headers, bytes.clone()).await {
            Ok(()) => {
                info!(
                    node_id = %failure.node_id,
                    node_type = %failure.node_type,
                    error_code = ?failure.error_code,
                    provider = ?failure.provider,
                    "node failure dead-lettered"
                );
                return;
            }
            Err(e) => {
                warn!(node_id = %failure.node_id, publish_attempt, error = %e, "dead-letter publish failed");
                tokio::time::sleep(Duration::from_secs(u64::from(publish_attempt))).await;
            }
        }
    }
    error!(
        node_id = %failure.node_id,
        failed_run_id = ?failed_run_id,
        "giving up on dead-lettering node failure"
    );
}

/// Republishes a failed work message for another attempt after `delay`.
async fn retry_later(
    jetstream: &jetstream::Context,
    subject: &str,
    payload: Vec<u8>,
    next_attempt: u32,
    delay: Duration,
) -> Result<(), String> {
    let delay = chrono::Duration::from_std(delay).map_err(|e| e.to_string())?;
    let mut headers = HeaderMap::new();
    headers.insert(ATTEMPT_HEADER, next_attempt.to_string().as_str());
    headers.insert(DELIVER_AT_HEADER, (Utc::now() + delay).to_rfc3339().as_str());
    publish(jetstream, subject.to_string(), headers, payload).await
}

/// Drives workflow runs from the work stream.
///
/// A message whose handling fails is retried until it has had
/// `work_max_deliver` attempts and is then moved to the dead-letter stream.
/// Payloads that are not trigger messages are dead-lettered right away, and
/// a node that fails its run is dead-lettered with its provider and error
/// code so remediation can restart the workflow at that node.
///
/// # Errors
///
/// Returns an error if the consumer cannot be created.
#[instrument(skip_all, fields(consumer = %settings.consumer_name))]
pub async fn run_work_consumer(
    jetstream: Arc<jetstream::Context>,
    settings: NatsSettings,
    lifecycle: Arc<RunLifecycle>,
) -> Result<(), Report<WorkerError>> {
    let config = settings.nats_config();
    let mut messages = pull(
        &jetstream,
        config.work_stream(),
        format!("{}-work", settings.consumer_name),
        format!("{WORK_SUBJECT_PREFIX}.>"),
    )
    .await?;
    let retry_delay = Duration::from_secs(settings.work_retry_seconds);
    info!("work consumer started");

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "work consumer stream error");
                continue;
            }
        };
        if hold_if_early(&message).await {
            continue;
        }

        let mut trigger: TriggerMessage = match serde_json::from_slice(&message.payload) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(subject = %message.subject, error = %e, "malformed work message");
                match dead_letter(&jetstream, &message.payload, &format!("malformed work message: {e}")).await {
                    Ok(()) => ack(&message).await,
                    Err(e) => {
                        error!(error = %e, "failed to dead-letter message");
                        nak(&message, retry_delay).await;
                    }
                }
                continue;
            }
        };

        let mut payload = message.payload.to_vec();
        if trigger.action == MessageAction::Start && trigger.workflow_run_id.is_none() {
            if let Some((published, sequence)) = published_at(&message) {
                let run_id = derived_run_id(published, sequence);
                trigger.workflow_run_id = Some(run_id);
                payload = with_run_id(&payload, run_id);
            }
        }

        match lifecycle.handle(&trigger).await {
            Ok(outcome) => {
                debug!(workflow_id = %trigger.workflow_id, ?outcome, "work message handled");
                if let Some(DriveOutcome::Failed {
                    failure: Some(failure),
                    ..
                }) = outcome.drive()
                {
                    let run_id = match &outcome {
                        HandleOutcome::Started { run_id, .. } => Some(*run_id),
                        HandleOutcome::Resumed(_) => trigger.workflow_run_id,
                    };
                    dead_letter_node_failure(&jetstream, failure, run_id, payload_retry_count(&payload))
                        .await;
                }
                ack(&message).await;
            }
            Err(report) => {
                let attempts = attempt(message.headers.as_ref());
                let reason = report.to_string();
                if i64::from(attempts) >= settings.work_max_deliver {
                    warn!(
                        workflow_id = %trigger.workflow_id,
                        attempts,
                        error = %reason,
                        "work message exhausted attempts, dead-lettering"
                    );
                    match dead_letter(&jetstream, &payload, &reason).await {
                        Ok(()) => ack(&message).await,
                        Err(e) => {
                            error!(error = %e, "failed to dead-letter message");
                            nak(&message, retry_delay).await;
                        }
                    }
                } else {
                    warn!(
                        workflow_id = %trigger.workflow_id,
                        attempts,
                        error = %reason,
                        "work message failed, will retry"
                    );
                    match retry_later(&jetstream, message.subject.as_str(), payload, attempts + 1, retry_delay).await {
                        Ok(()) => ack(&message).await,
                        Err(e) => {
                            warn!(error = %e, "failed to republish work message, redelivering");
                            nak(&message, retry_delay).await;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Feeds the dead-letter stream through the remediation pipeline.
///
/// # Errors
///
/// Returns an error if the consumer cannot be created.
#[instrument(skip_all, fields(consumer = %settings.consumer_name))]
pub async fn run_dlq_consumer(
    jetstream: Arc<jetstream::Context>,
    settings: NatsSettings,
    pipeline: Arc<DlqPipeline>,
) -> Result<(), Report<WorkerError>> {
    let mut messages = pull(
        &jetstream,
        DLQ_STREAM,
        format!("{}-dlq", settings.consumer_name),
        DLQ_SUBJECT.to_string(),
    )
    .await?;
    let retry_delay = Duration::from_secs(settings.work_retry_seconds);
    info!("dead-letter consumer started");

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dead-letter consumer stream error");
                continue;
            }
        };
        let id = message
            .info()
            .map(|info| info.stream_sequence.to_string())
            .unwrap_or_else(|_| ulid::Ulid::new().to_string());
        let dlq = dlq_message(id, &message.payload, message.headers.as_ref());

        match pipeline.handle_message(&dlq).await {
            Ok(disposition) if disposition.is_acknowledged() => {
                debug!(message_id = %dlq.message_id, ?disposition, "dead letter handled");
                ack(&message).await;
            }
            Ok(_) => nak(&message, retry_delay).await,
            Err(report) => {
                error!(message_id = %dlq.message_id, error = %report, "dead letter handling failed");
                nak(&message, retry_delay).await;
            }
        }
    }
    Ok(())
}

/// Retries emails the warm-up governor deferred.
///
/// # Errors
///
/// Returns an error if the consumer cannot be created.
#[instrument(skip_all, fields(consumer = %settings.consumer_name))]
pub async fn run_deferred_consumer(
    jetstream: Arc<jetstream::Context>,
    settings: NatsSettings,
    sender: Arc<GovernedSender>,
) -> Result<(), Report<WorkerError>> {
    let mut messages = pull(
        &jetstream,
        DEFERRED_STREAM,
        format!("{}-deferred", settings.consumer_name),
        DEFERRED_SUBJECT.to_string(),
    )
    .await?;
    let retry_delay = Duration::from_secs(settings.work_retry_seconds);
    info!("deferred email consumer started");

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "deferred consumer stream error");
                continue;
            }
        };
        if hold_if_early(&message).await {
            continue;
        }

        let deferred: DeferredEmail = match serde_json::from_slice(&message.payload) {
            Ok(deferred) => deferred,
            Err(e) => {
                error!(error = %e, "malformed deferred email, dropping");
                term(&message).await;
                continue;
            }
        };

        match sender.redeliver(&deferred).await {
            Ok(outcome) => {
                debug!(domain = %deferred.domain, ?outcome, "deferred email handled");
                ack(&message).await;
            }
            Err(report) => {
                warn!(domain = %deferred.domain, error = %report, "deferred email failed, will redeliver");
                nak(&message, retry_delay).await;
            }
        }
    }
    Ok(())
}

/// Applies provider feedback and warm-up commands.
///
/// Feedback notifications move the bounce, complaint and engagement
/// counters and may auto-pause a warm-up. Commands start, pause, resume or
/// cancel warm-ups. Payloads that cannot be parsed, and commands the
/// governor rejects, are terminated; store failures are redelivered.
///
/// # Errors
///
/// Returns an error if the consumer cannot be created.
#[instrument(skip_all, fields(consumer = %settings.consumer_name))]
pub async fn run_warmup_consumer(
    jetstream: Arc<jetstream::Context>,
    settings: NatsSettings,
    governor: Arc<SendRateGovernor>,
) -> Result<(), Report<WorkerError>> {
    let mut messages = pull(
        &jetstream,
        WARMUP_STREAM,
        format!("{}-warmup", settings.consumer_name),
        format!("{WARMUP_SUBJECT_PREFIX}.>"),
    )
    .await?;
    let retry_delay = Duration::from_secs(settings.work_retry_seconds);
    info!("warm-up consumer started");

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "warm-up consumer stream error");
                continue;
            }
        };

        match message.subject.as_str() {
            WARMUP_FEEDBACK_SUBJECT => match FeedbackNotification::parse(&message.payload) {
                Ok(notification) => {
                    let outcome = governor.record_feedback(&notification).await;
                    debug!(?outcome, "feedback handled");
                    ack(&message).await;
                }
                Err(e) => {
                    warn!(error = %e, "malformed feedback notification, dropping");
                    term(&message).await;
                }
            },
            WARMUP_COMMANDS_SUBJECT => {
                let command: WarmupCommand = match serde_json::from_slice(&message.payload) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(error = %e, "malformed warm-up command, dropping");
                        term(&message).await;
                        continue;
                    }
                };
                match governor.apply(command).await {
                    Ok(outcome) => {
                        info!(?outcome, "warm-up command applied");
                        ack(&message).await;
                    }
                    Err(report) if matches!(report.current_context(), WarmupError::Store(_)) => {
                        warn!(error = %report, "warm-up command failed, will redeliver");
                        nak(&message, retry_delay).await;
                    }
                    Err(report) => {
                        warn!(error = %report, "warm-up command rejected");
                        term(&message).await;
                    }
                }
            }
            other => {
                warn!(subject = other, "unexpected warm-up subject, dropping");
                term(&message).await;
            }
        }
    }
    Ok(())
}
