//! Wake-up persistence.

use crate::wake::ScheduledWake;
use amber_relay_workflow::ScheduleError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Keyed store of pending wake-ups.
#[async_trait]
pub trait WakeStore: Send + Sync {
    /// Stores `wake` unless its key is already pending. Returns true if it
    /// was stored.
    async fn insert(&self, wake: &ScheduledWake) -> Result<bool, ScheduleError>;

    /// Claims up to `limit` unclaimed wake-ups due at `now`, earliest first,
    /// for `lease`. A claimed wake-up is hidden from other callers until it
    /// is removed, released, or its lease runs out.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: TimeDelta,
        limit: usize,
    ) -> Result<Vec<ScheduledWake>, ScheduleError>;

    /// Drops the claim on a wake-up so the next pass can take it.
    async fn release(&self, key: &str) -> Result<(), ScheduleError>;

    /// Removes a pending wake-up. Returns true if one was removed.
    async fn remove(&self, key: &str) -> Result<bool, ScheduleError>;

    /// Looks up a pending wake-up.
    async fn get(&self, key: &str) -> Result<Option<ScheduledWake>, ScheduleError>;

    /// Number of pending wake-ups.
    async fn count(&self) -> Result<u64, ScheduleError>;
}

#[derive(Debug, Clone)]
struct Entry {
    wake: ScheduledWake,
    claimed_until: Option<DateTime<Utc>>,
}

impl Entry {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.wake.is_due(now) && self.claimed_until.is_none_or(|until| until <= now)
    }
}

/// Wake-ups held in a map; lost on restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWakeStore {
    wakes: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryWakeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WakeStore for InMemoryWakeStore {
    async fn insert(&self, wake: &ScheduledWake) -> Result<bool, ScheduleError> {
        let mut wakes = self.wakes.lock().unwrap();
        if wakes.contains_key(&wake.key) {
            return Ok(false);
        }
        wakes.insert(
            wake.key.clone(),
            Entry {
                wake: wake.clone(),
                claimed_until: None,
            },
        );
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: TimeDelta,
        limit: usize,
    ) -> Result<Vec<ScheduledWake>, ScheduleError> {
        let mut wakes = self.wakes.lock().unwrap();
        let mut due: Vec<(DateTime<Utc>, String)> = wakes
            .values()
            .filter(|entry| entry.claimable(now))
            .map(|entry| (entry.wake.fire_at, entry.wake.key.clone()))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit)
            .filter_map(|(_, key)| {
                let entry = wakes.get_mut(&key)?;
                entry.claimed_until = Some(now + lease);
                Some(entry.wake.clone())
            })
            .collect())
    }

    async fn release(&self, key: &str) -> Result<(), ScheduleError> {
        if let Some(entry) = self.wakes.lock().unwrap().get_mut(key) {
            entry.claimed_until = None;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, ScheduleError> {
        Ok(self.wakes.lock().unwrap().remove(key).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<ScheduledWake>, ScheduleError> {
        Ok(self.wakes.lock().unwrap().get(key).map(|entry| entry.wake.clone()))
    }

    async fn count(&self) -> Result<u64, ScheduleError> {
        Ok(self.wakes.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_relay_core::{WakeId, WorkflowId, WorkspaceId};
    use amber_relay_workflow::TriggerMessage;
    use chrono::TimeZone;

    fn wake(key: &str, hour: u32) -> ScheduledWake {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap();
        ScheduledWake {
            id: WakeId::new(),
            key: key.to_string(),
            fire_at: at,
            message: TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_schedule"),
            created_at: at,
        }
    }

    fn lease() -> TimeDelta {
        TimeDelta::minutes(5)
    }

    #[tokio::test]
    async fn claim_due_is_earliest_first_and_bounded() {
        let store = InMemoryWakeStore::new();
        store.insert(&wake("late", 9)).await.expect("insert");
        store.insert(&wake("early", 7)).await.expect("insert");
        store.insert(&wake("future", 20)).await.expect("insert");

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let first = store.claim_due(now, lease(), 1).await.expect("claim");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, "early");

        let rest = store.claim_due(now, lease(), 10).await.expect("claim");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "late");
        assert!(store.claim_due(now, lease(), 10).await.expect("claim").is_empty());
        assert_eq!(store.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn claims_expire_and_can_be_released() {
        let store = InMemoryWakeStore::new();
        store.insert(&wake("a", 7)).await.expect("insert");
        store.insert(&wake("b", 7)).await.expect("insert");
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        assert_eq!(store.claim_due(now, lease(), 10).await.expect("claim").len(), 2);

        store.release("a").await.expect("release");
        let again = store.claim_due(now, lease(), 10).await.expect("claim");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].key, "a");

        // Nobody removed "b": it comes back once the lease runs out.
        let later = store.claim_due(now + lease(), lease(), 10).await.expect("claim");
        let keys: Vec<_> = later.iter().map(|w| w.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn insert_keeps_the_first_wake_per_key() {
        let store = InMemoryWakeStore::new();
        assert!(store.insert(&wake("k", 7)).await.expect("insert"));
        assert!(!store.insert(&wake("k", 9)).await.expect("insert"));
        let stored = store.get("k").await.expect("get").expect("pending");
        assert_eq!(stored.fire_at, Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap());
    }
}
