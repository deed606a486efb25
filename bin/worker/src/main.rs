//! amber-relay worker.
//!
//! Runs the workflow lifecycle off the work stream, remediates dead letters,
//! retries deferred emails, fires long-wait wake-ups and advances email
//! warm-up schedules once a day. Runs, wake-ups and warm-ups live in Postgres.

mod config;
mod consumers;
mod db;
mod error;
mod tasks;
mod transport;

use amber_relay_dispatch::{
    CircuitBreakerRegistry, ExecutorRegistry, NodeDispatcher, NodeExecutor, PassthroughExecutor,
    WaitExecutor,
};
use amber_relay_remediation::{AlertChannel, AlertService, DlqPipeline, LogAlertSink};
use amber_relay_scheduler::OneShotScheduler;
use amber_relay_warmup::{
    GovernedSender, HealthService, SEND_EMAIL_NODE_TYPE, SendEmailExecutor, SendRateGovernor,
};
use amber_relay_workflow::memory::InMemoryWorkflowSource;
use amber_relay_workflow::nats::{NatsDelayQueue, NatsLifecycleEvents};
use amber_relay_workflow::{DelayQueue, RunLifecycle};
use crate::config::WorkerConfig;
use crate::db::{PgRunStore, PgWakeStore, PgWarmupStore};
use crate::error::WorkerError;
use crate::transport::{
    NatsAlertSink, NatsDeferredQueue, NatsDnsChecker, NatsEmailTransport, NatsFailureStore,
    NatsRequeue,
};
use rootcause::prelude::Report;
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Node types that complete without side effects in this worker.
const PASSTHROUGH_NODE_TYPES: &[&str] = &[
    "trigger_form_submitted",
    "trigger_chat_message",
    "trigger_tag_added",
    "trigger_webhook",
    "trigger_schedule",
    "trigger_segment_event",
    "logic_branch",
    "logic_ab_split",
    "logic_filter",
    "action_update_contact",
];

/// How often expired warm-up counters are deleted.
const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Report<WorkerError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,async_nats=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().map_err(WorkerError::from)?;
    tracing::info!(nats_url = %config.nats.url, "Loaded configuration");

    let nats_config = config.nats.nats_config();
    let (client, jetstream) = amber_relay_workflow::nats::connect(&nats_config)
        .await
        .map_err(|e| WorkerError::Nats {
            message: e.to_string(),
        })?;
    transport::ensure_streams(&jetstream)
        .await
        .map_err(|message| WorkerError::Nats { message })?;
    let jetstream = Arc::new(jetstream);
    tracing::info!("Connected to NATS");

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| WorkerError::Database {
            message: e.to_string(),
        })?;
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| WorkerError::Database {
            message: e.to_string(),
        })?;

    let flags = Arc::new(config.flags.feature_flags(std::env::vars()));

    // Email warm-up
    let warmup_store = Arc::new(PgWarmupStore::new(db_pool.clone()));
    let governor = Arc::new(SendRateGovernor::new(warmup_store.clone()));
    let health = Arc::new(HealthService::new(
        warmup_store.clone(),
        Arc::new(NatsDnsChecker::new(
            client,
            config.warmup.dns_check_subject.clone(),
            Duration::from_secs(config.warmup.dns_check_timeout_seconds),
        )),
    ));
    let sender = Arc::new(
        GovernedSender::new(
            governor.clone(),
            Arc::new(NatsEmailTransport::new(jetstream.clone())),
        )
        .with_deferred_queue(Arc::new(NatsDeferredQueue::new(
            jetstream.clone(),
            Duration::from_secs(config.warmup.deferred_retry_seconds),
        ))),
    );

    // Node dispatch
    let passthrough: Arc<dyn NodeExecutor> = Arc::new(PassthroughExecutor);
    let executors = PASSTHROUGH_NODE_TYPES
        .iter()
        .fold(ExecutorRegistry::new(), |registry, node_type| {
            registry.with(*node_type, passthrough.clone())
        })
        .with("action_wait", Arc::new(WaitExecutor))
        .with(SEND_EMAIL_NODE_TYPE, Arc::new(SendEmailExecutor::new(sender.clone())));
    let mut dispatcher =
        NodeDispatcher::new(executors, CircuitBreakerRegistry::default(), flags.clone());
    if let Some(seed) = config.retry_seed {
        dispatcher = dispatcher.with_seed(seed);
    }

    // Run lifecycle
    let graphs = InMemoryWorkflowSource::new();
    if let Some(dir) = &config.workflows_dir {
        let loaded = tasks::load_graphs(Path::new(dir), &graphs)?;
        tracing::info!(dir = %dir, loaded, "Loaded workflow graphs");
    }
    let queue: Arc<dyn DelayQueue> = Arc::new(NatsDelayQueue::new(jetstream.clone()));
    let scheduler = OneShotScheduler::new(Arc::new(PgWakeStore::new(db_pool.clone())));
    let lifecycle = Arc::new(RunLifecycle::new(
        Arc::new(dispatcher),
        Arc::new(graphs),
        Arc::new(PgRunStore::new(db_pool)),
        queue.clone(),
        Arc::new(scheduler.clone()),
        Arc::new(NatsLifecycleEvents::new(jetstream.clone())),
    ));

    // Dead-letter remediation
    let alerts = [AlertChannel::Email, AlertChannel::Sns, AlertChannel::Webhook]
        .into_iter()
        .fold(
            AlertService::new().with_sink(Arc::new(LogAlertSink::new(AlertChannel::InApp))),
            |service, channel| {
                service.with_sink(Arc::new(NatsAlertSink::new(jetstream.clone(), channel)))
            },
        );
    let mut pipeline = DlqPipeline::new(
        flags,
        Arc::new(NatsRequeue::new(jetstream.clone())),
        Arc::new(alerts),
        Arc::new(NatsFailureStore::new(jetstream.clone())),
    )
    .with_config(config.dlq.dlq_config());
    if let Some(seed) = config.retry_seed {
        pipeline = pipeline.with_seed(seed);
    }
    let pipeline = Arc::new(pipeline);

    // Background tasks
    let tick = Duration::from_secs(config.scheduler_tick_seconds);
    let wake_queue = queue.clone();
    tokio::spawn(async move { scheduler.run(wake_queue, tick).await });

    let advance_offset = Duration::from_secs(config.warmup.advance_offset_seconds);
    tokio::spawn(tasks::run_daily_advance(governor.clone(), advance_offset));
    tokio::spawn(tasks::run_health_sweep(
        health,
        Duration::from_secs(config.warmup.health_interval_seconds),
    ));
    tokio::spawn(tasks::run_counter_purge(warmup_store, COUNTER_PURGE_INTERVAL));

    let work = tokio::spawn(consumers::run_work_consumer(
        jetstream.clone(),
        config.nats.clone(),
        lifecycle,
    ));
    let dlq = tokio::spawn(consumers::run_dlq_consumer(
        jetstream.clone(),
        config.nats.clone(),
        pipeline,
    ));
    let deferred = tokio::spawn(consumers::run_deferred_consumer(
        jetstream.clone(),
        config.nats.clone(),
        sender,
    ));
    let warmup = tokio::spawn(consumers::run_warmup_consumer(
        jetstream,
        config.nats.clone(),
        governor,
    ));
    tracing::info!("Worker started");

    for (name, handle) in [
        ("work", work),
        ("dlq", dlq),
        ("deferred", deferred),
        ("warmup", warmup),
    ] {
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => tracing::warn!(consumer = name, "consumer stopped"),
                Ok(Err(report)) => tracing::error!(consumer = name, error = %report, "consumer failed"),
                Err(e) => tracing::error!(consumer = name, error = %e, "consumer panicked"),
            }
        });
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
    Ok(())
}
