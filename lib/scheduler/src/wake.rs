//! One-shot wake-up scheduling for long workflow waits.
//!
//! Each wake-up fires once at an absolute time, handing its resume message
//! to the delay queue with no delay. Pending wake-ups live in a
//! [`WakeStore`] so they survive restarts. A wake-up is claimed before it is
//! delivered and removed only after the queue accepts it, so a worker that
//! dies mid-pass leaves it to be claimed again once the lease runs out.

use crate::store::WakeStore;
use amber_relay_core::{Clock, SystemClock, WakeId};
use amber_relay_workflow::{DelayQueue, QueueError, ScheduleError, TriggerMessage, WakeScheduler};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A pending wake-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledWake {
    pub id: WakeId,
    pub key: String,
    pub fire_at: DateTime<Utc>,
    pub message: TriggerMessage,
    pub created_at: DateTime<Utc>,
}

impl ScheduledWake {
    /// Returns true if the wake-up should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

/// Outcome of one [`OneShotScheduler::fire_due`] pass.
#[derive(Debug, Default)]
pub struct FireReport {
    /// Keys handed to the delay queue.
    pub fired: Vec<String>,
    /// Keys whose hand-off failed; they stay scheduled for the next pass.
    pub failed: Vec<(String, QueueError)>,
}

/// Wake-ups claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// How long a claimed wake-up stays hidden from other passes.
pub const CLAIM_LEASE: TimeDelta = TimeDelta::minutes(5);

/// One-shot scheduler over a [`WakeStore`].
#[derive(Clone)]
pub struct OneShotScheduler {
    store: Arc<dyn WakeStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl OneShotScheduler {
    /// Creates a scheduler on the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn WakeStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates a scheduler on `clock`.
    #[must_use]
    pub fn with_clock(store: Arc<dyn WakeStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Number of wake-ups not yet fired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn pending_count(&self) -> Result<u64, ScheduleError> {
        self.store.count().await
    }

    /// Looks up a pending wake-up.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get(&self, key: &str) -> Result<Option<ScheduledWake>, ScheduleError> {
        self.store.get(key).await
    }

    /// Fires every wake-up due at `now` into `queue`.
    ///
    /// Due entries are claimed before delivery so concurrent passes do not
    /// both fire a key, and removed once delivered. Failed deliveries are
    /// released for the next pass.
    pub async fn fire_due(&self, now: DateTime<Utc>, queue: &dyn DelayQueue) -> FireReport {
        let mut report = FireReport::default();
        loop {
            let due = match self.store.claim_due(now, CLAIM_LEASE, self.batch_size).await {
                Ok(due) => due,
                Err(e) => {
                    warn!(error = %e, "failed to read due wake-ups");
                    return report;
                }
            };
            let exhausted = due.len() < self.batch_size;

            for wake in due {
                match queue.enqueue(&wake.message, Duration::ZERO, &wake.key).await {
                    Ok(()) => {
                        info!(key = %wake.key, fire_at = %wake.fire_at, "wake-up fired");
                        // The resume is deduplicated on the key, so a wake-up
                        // that outlives its lease and fires again is harmless.
                        if let Err(e) = self.store.remove(&wake.key).await {
                            warn!(key = %wake.key, error = %e, "failed to remove fired wake-up");
                        }
                        report.fired.push(wake.key);
                    }
                    Err(e) => {
                        warn!(key = %wake.key, error = %e, "wake-up delivery failed, will retry");
                        if let Err(release) = self.store.release(&wake.key).await {
                            warn!(key = %wake.key, error = %release, "failed to release wake-up");
                        }
                        report.failed.push((wake.key, e));
                    }
                }
            }

            // Failed wake-ups are due again, so stop after a failing batch.
            if exhausted || !report.failed.is_empty() {
                return report;
            }
        }
    }

    /// Fires due wake-ups every `tick` until the task is dropped.
    pub async fn run(&self, queue: Arc<dyn DelayQueue>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let report = self.fire_due(self.clock.now(), queue.as_ref()).await;
            if !report.fired.is_empty() || !report.failed.is_empty() {
                debug!(
                    fired = report.fired.len(),
                    failed = report.failed.len(),
                    "scheduler pass"
                );
            }
        }
    }
}

#[async_trait]
impl WakeScheduler for OneShotScheduler {
    async fn schedule_once(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        message: &TriggerMessage,
    ) -> Result<(), ScheduleError> {
        let now = self.clock.now();
        if fire_at <= now {
            return Err(ScheduleError::FireTimeInPast {
                key: key.to_string(),
            });
        }

        let wake = ScheduledWake {
            id: WakeId::new(),
            key: key.to_string(),
            fire_at,
            message: message.clone(),
            created_at: now,
        };
        if self.store.insert(&wake).await? {
            debug!(key, %fire_at, "wake-up scheduled");
        } else {
            debug!(key, "wake-up already scheduled");
        }
        Ok(())
    }

    async fn cancel(&self, key: &str) -> Result<bool, ScheduleError> {
        self.store.remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_relay_core::{ManualClock, WorkflowId, WorkspaceId};
    use crate::store::InMemoryWakeStore;
    use amber_relay_workflow::memory::InMemoryDelayQueue;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn message() -> TriggerMessage {
        TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_schedule")
    }

    fn scheduler() -> OneShotScheduler {
        OneShotScheduler::with_clock(
            Arc::new(InMemoryWakeStore::new()),
            Arc::new(ManualClock::new(start())),
        )
    }

    struct FailingQueue;

    #[async_trait]
    impl DelayQueue for FailingQueue {
        async fn enqueue(
            &self,
            _message: &TriggerMessage,
            _delay: Duration,
            _dedup_key: &str,
        ) -> Result<(), QueueError> {
            Err(QueueError::PublishFailed {
                message: "broker down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn fires_once_when_due() {
        let clock = ManualClock::new(start());
        let scheduler = OneShotScheduler::with_clock(Arc::new(InMemoryWakeStore::new()), Arc::new(clock.clone()));
        let queue = InMemoryDelayQueue::new();
        let fire_at = start() + chrono::Duration::hours(3);

        scheduler
            .schedule_once("run_1:4", fire_at, &message())
            .await
            .expect("schedule");

        let report = scheduler.fire_due(start() + chrono::Duration::hours(1), &queue).await;
        assert!(report.fired.is_empty());
        assert_eq!(scheduler.pending_count().await.expect("count"), 1);

        let report = scheduler.fire_due(fire_at, &queue).await;
        assert_eq!(report.fired, vec!["run_1:4".to_string()]);
        assert_eq!(scheduler.pending_count().await.expect("count"), 0);

        let queued = queue.pending();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].delay, Duration::ZERO);
        assert_eq!(queued[0].dedup_key, "run_1:4");

        let report = scheduler.fire_due(fire_at + chrono::Duration::hours(1), &queue).await;
        assert!(report.fired.is_empty());
    }

    #[tokio::test]
    async fn duplicate_schedule_is_ignored() {
        let scheduler = scheduler();
        let first = start() + chrono::Duration::hours(1);
        scheduler.schedule_once("k", first, &message()).await.expect("schedule");
        scheduler
            .schedule_once("k", first + chrono::Duration::hours(5), &message())
            .await
            .expect("schedule again");

        assert_eq!(
            scheduler.get("k").await.expect("get").map(|w| w.fire_at),
            Some(first)
        );
    }

    #[tokio::test]
    async fn past_fire_time_is_rejected() {
        let scheduler = scheduler();
        let err = scheduler
            .schedule_once("k", start(), &message())
            .await
            .expect_err("past");
        assert!(matches!(err, ScheduleError::FireTimeInPast { .. }));
    }

    #[tokio::test]
    async fn cancel_removes_pending() {
        let scheduler = scheduler();
        scheduler
            .schedule_once("k", start() + chrono::Duration::hours(1), &message())
            .await
            .expect("schedule");

        assert!(scheduler.cancel("k").await.expect("cancel"));
        assert!(!scheduler.cancel("k").await.expect("cancel"));
        assert_eq!(scheduler.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn failed_delivery_stays_scheduled() {
        let scheduler = scheduler();
        let fire_at = start() + chrono::Duration::hours(1);
        scheduler.schedule_once("k", fire_at, &message()).await.expect("schedule");

        let report = scheduler.fire_due(fire_at, &FailingQueue).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(scheduler.pending_count().await.expect("count"), 1);

        let queue = InMemoryDelayQueue::new();
        let report = scheduler.fire_due(fire_at, &queue).await;
        assert_eq!(report.fired.len(), 1);
    }

    #[tokio::test]
    async fn wakes_in_one_store_survive_a_new_scheduler() {
        let store = Arc::new(InMemoryWakeStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let fire_at = start() + chrono::Duration::days(3);
        OneShotScheduler::with_clock(store.clone(), clock.clone())
            .schedule_once("k", fire_at, &message())
            .await
            .expect("schedule");

        let restarted = OneShotScheduler::with_clock(store, clock);
        let queue = InMemoryDelayQueue::new();
        let report = restarted.fire_due(fire_at, &queue).await;
        assert_eq!(report.fired, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn abandoned_claim_fires_after_the_lease() {
        let store = Arc::new(InMemoryWakeStore::new());
        let scheduler = OneShotScheduler::with_clock(store.clone(), Arc::new(ManualClock::new(start())));
        let fire_at = start() + chrono::Duration::hours(1);
        scheduler.schedule_once("k", fire_at, &message()).await.expect("schedule");

        // A pass that claimed the wake-up and never delivered it.
        let claimed = store.claim_due(fire_at, CLAIM_LEASE, 10).await.expect("claim");
        assert_eq!(claimed.len(), 1);

        let queue = InMemoryDelayQueue::new();
        assert!(scheduler.fire_due(fire_at, &queue).await.fired.is_empty());
        assert_eq!(scheduler.pending_count().await.expect("count"), 1);

        let report = scheduler.fire_due(fire_at + CLAIM_LEASE, &queue).await;
        assert_eq!(report.fired, vec!["k".to_string()]);
        assert_eq!(scheduler.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn drains_more_than_one_batch() {
        let mut scheduler = scheduler();
        scheduler.batch_size = 2;
        let fire_at = start() + chrono::Duration::hours(1);
        for i in 0..5 {
            scheduler
                .schedule_once(&format!("k{i}"), fire_at, &message())
                .await
                .expect("schedule");
        }

        let queue = InMemoryDelayQueue::new();
        let report = scheduler.fire_due(fire_at, &queue).await;
        assert_eq!(report.fired.len(), 5);
        assert_eq!(scheduler.pending_count().await.expect("count"), 0);
    }
}
