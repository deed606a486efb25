//! Delayed redelivery of lifecycle messages.
//!
//! Short waits go back onto the work transport with a delay. Waits longer
//! than the transport can hold go to a one-shot wake scheduler.

use crate::error::{QueueError, ScheduleError};
use crate::message::TriggerMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Longest delay the work transport accepts.
pub const MAX_QUEUE_DELAY: Duration = Duration::from_secs(900);

/// Re-enqueues messages after a delay.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Enqueues `message` for delivery after `delay`.
    ///
    /// A second enqueue with the same `dedup_key` is dropped.
    async fn enqueue(
        &self,
        message: &TriggerMessage,
        delay: Duration,
        dedup_key: &str,
    ) -> Result<(), QueueError>;
}

/// Schedules a single delivery at an absolute time.
#[async_trait]
pub trait WakeScheduler: Send + Sync {
    /// Registers `message` to fire once at `fire_at` under `key`.
    ///
    /// Re-registering an existing key is a no-op.
    async fn schedule_once(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        message: &TriggerMessage,
    ) -> Result<(), ScheduleError>;

    /// Removes a pending schedule. Returns false if none existed.
    async fn cancel(&self, key: &str) -> Result<bool, ScheduleError>;
}

/// Rejects delays the transport cannot hold.
///
/// # Errors
///
/// Returns [`QueueError::DelayTooLong`] when `delay` exceeds [`MAX_QUEUE_DELAY`].
pub fn check_delay(delay: Duration) -> Result<(), QueueError> {
    if delay > MAX_QUEUE_DELAY {
        return Err(QueueError::DelayTooLong {
            seconds: delay.as_secs(),
            max_seconds: MAX_QUEUE_DELAY.as_secs(),
        });
    }
    Ok(())
}
