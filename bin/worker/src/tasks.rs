//! Startup loading and periodic background tasks.

use crate::error::WorkerError;
use crate::db::PgWarmupStore;
use amber_relay_warmup::{
    AdvanceSummary, DomainHealthReport, HealthService, HealthStatus, SendRateGovernor,
};
use amber_relay_workflow::WorkflowGraph;
use amber_relay_workflow::memory::InMemoryWorkflowSource;
use chrono::{DateTime, Days, NaiveTime, TimeDelta, Utc};
use rootcause::prelude::Report;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Loads every `*.json` workflow graph in `dir` into `source`.
///
/// # Errors
///
/// Returns an error naming the first file that cannot be read or parsed.
pub fn load_graphs(dir: &Path, source: &InMemoryWorkflowSource) -> Result<usize, Report<WorkerError>> {
    let failed = |path: &Path, message: String| WorkerError::Graphs {
        path: path.display().to_string(),
        message,
    };
    let entries = std::fs::read_dir(dir).map_err(|e| failed(dir, e.to_string()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| failed(dir, e.to_string()))?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in &paths {
        let bytes = std::fs::read(path).map_err(|e| failed(path, e.to_string()))?;
        let graph: WorkflowGraph =
            serde_json::from_slice(&bytes).map_err(|e| failed(path, e.to_string()))?;
        info!(
            path = %path.display(),
            workflow_id = %graph.workflow_id,
            nodes = graph.nodes.len(),
            "workflow graph loaded"
        );
        source.insert(graph);
    }
    Ok(paths.len())
}

/// Next UTC midnight plus `offset` strictly after `now`.
#[must_use]
pub fn next_advance_at(now: DateTime<Utc>, offset: TimeDelta) -> DateTime<Utc> {
    let today = now.date_naive().and_time(NaiveTime::MIN).and_utc() + offset;
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Advances every active warm-up once per day, shortly after UTC midnight,
/// for the day that just ended.
pub async fn run_daily_advance(governor: Arc<SendRateGovernor>, offset: Duration) {
    let offset = TimeDelta::from_std(offset).unwrap_or(TimeDelta::minutes(5));
    loop {
        let now = Utc::now();
        let at = next_advance_at(now, offset);
        tokio::time::sleep((at - now).to_std().unwrap_or(Duration::ZERO)).await;

        let Some(day) = at.date_naive().checked_sub_days(Days::new(1)) else {
            continue;
        };
        match governor.advance_all(day).await {
            Ok(summary) => log_advance(day, &summary),
            Err(report) => error!(%day, error = %report, "warm-up advance failed"),
        }
    }
}

fn log_advance(day: chrono::NaiveDate, summary: &AdvanceSummary) {
    info!(
        %day,
        advanced = summary.advanced.len(),
        completed = summary.completed.len(),
        failed = summary.failed.len(),
        "warm-up schedules advanced"
    );
    if !summary.failed.is_empty() {
        warn!(%day, domains = ?summary.failed, "warm-up advance failed for some domains");
    }
}

/// Domains whose health is not good, with their scores.
fn unhealthy(reports: &[DomainHealthReport]) -> Vec<(String, u8)> {
    reports
        .iter()
        .filter(|report| report.status != HealthStatus::Good)
        .map(|report| (report.domain.clone(), report.score))
        .collect()
}

/// Scores every active warm-up's sending health every `interval`, caching
/// the result on the warm-up record.
pub async fn run_health_sweep(health: Arc<HealthService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match health.check_active().await {
            Ok(reports) => {
                let unhealthy = unhealthy(&reports);
                info!(checked = reports.len(), unhealthy = unhealthy.len(), "warm-up health sweep");
                for (domain, score) in unhealthy {
                    warn!(%domain, score, "warm-up domain health degraded");
                }
            }
            Err(report) => error!(error = %report, "warm-up health sweep failed"),
        }
    }
}

/// Deletes expired warm-up counters every `interval`.
pub async fn run_counter_purge(store: Arc<PgWarmupStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match store.purge_expired_counters().await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "expired warm-up counters purged"),
            Err(e) => warn!(error = %e, "warm-up counter purge failed"),
        }
    }
}
