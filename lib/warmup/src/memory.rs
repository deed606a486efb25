//! In-process implementations of the warm-up collaborators.

use crate::deferred::{DeferredEmail, DeferredQueue, EmailTransport, OutboundEmail};
use crate::domain::{WarmupDomain, WarmupStatus};
use crate::error::{CheckerError, QueueError, StoreError, TransportError};
use crate::governor::{DomainAuthChecker, DomainAuthStatus};
use crate::health::{DnsHealth, DnsHealthChecker};
use crate::store::{
    CounterKind, DAILY_COUNTER_TTL, DailyCounter, HOURLY_COUNTER_TTL, WarmupStore,
};
use amber_relay_core::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn live(entry: Option<&Self>, now: DateTime<Utc>) -> Option<&T> {
        entry.filter(|e| e.expires_at > now).map(|e| &e.value)
    }
}

type DailyKey = (String, NaiveDate);
type HourlyKey = (String, NaiveDate, u32);

/// Keeps records and counters in maps, expiring counters by the clock.
#[derive(Clone)]
pub struct InMemoryWarmupStore {
    records: Arc<Mutex<HashMap<String, WarmupDomain>>>,
    daily: Arc<Mutex<HashMap<DailyKey, Expiring<DailyCounter>>>>,
    hourly: Arc<Mutex<HashMap<HourlyKey, Expiring<u64>>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryWarmupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWarmupStore")
            .field("records", &self.records.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryWarmupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWarmupStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            daily: Arc::new(Mutex::new(HashMap::new())),
            hourly: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(SystemClock),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Uses `clock` for counter expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drops counters whose expiry has passed.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.daily.lock().unwrap().retain(|_, e| e.expires_at > now);
        self.hourly.lock().unwrap().retain(|_, e| e.expires_at > now);
    }

    /// Number of live hourly counters.
    #[must_use]
    pub fn hourly_counter_count(&self) -> usize {
        let now = self.clock.now();
        self.hourly
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "store offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WarmupStore for InMemoryWarmupStore {
    async fn get(&self, domain: &str) -> Result<Option<WarmupDomain>, StoreError> {
        self.check_available()?;
        Ok(self.records.lock().unwrap().get(domain).cloned())
    }

    async fn create(&self, record: &WarmupDomain) -> Result<(), StoreError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.domain) {
            return Err(StoreError::AlreadyExists {
                domain: record.domain.clone(),
            });
        }
        records.insert(record.domain.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &WarmupDomain) -> Result<WarmupDomain, StoreError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let stored = records
            .get_mut(&record.domain)
            .ok_or_else(|| StoreError::NotFound {
                domain: record.domain.clone(),
            })?;
        if stored.version != record.version {
            return Err(StoreError::Conflict {
                domain: record.domain.clone(),
            });
        }
        let mut updated = record.clone();
        updated.version += 1;
        updated.updated_at = self.clock.now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, domain: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.records.lock().unwrap().remove(domain).is_some())
    }

    async fn list_active(&self) -> Result<Vec<WarmupDomain>, StoreError> {
        self.check_available()?;
        let mut active: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == WarmupStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(active)
    }

    async fn increment_daily(
        &self,
        domain: &str,
        date: NaiveDate,
        kind: CounterKind,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut daily = self.daily.lock().unwrap();
        let entry = daily
            .entry((domain.to_string(), date))
            .or_insert_with(|| Expiring {
                value: DailyCounter::default(),
                expires_at: now + DAILY_COUNTER_TTL,
            });
        if entry.expires_at <= now {
            *entry = Expiring {
                value: DailyCounter::default(),
                expires_at: now + DAILY_COUNTER_TTL,
            };
        }
        Ok(entry.value.increment(kind))
    }

    async fn increment_hourly_send(
        &self,
        domain: &str,
        date: NaiveDate,
        hour: u32,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut hourly = self.hourly.lock().unwrap();
        let entry = hourly
            .entry((domain.to_string(), date, hour))
            .or_insert_with(|| Expiring {
                value: 0,
                expires_at: now + HOURLY_COUNTER_TTL,
            });
        if entry.expires_at <= now {
            *entry = Expiring {
                value: 0,
                expires_at: now + HOURLY_COUNTER_TTL,
            };
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn daily_counter(&self, domain: &str, date: NaiveDate) -> Result<DailyCounter, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let daily = self.daily.lock().unwrap();
        Ok(Expiring::live(daily.get(&(domain.to_string(), date)), now)
            .copied()
            .unwrap_or_default())
    }
}

/// Answers authentication checks with a fixed status, or fails every lookup.
#[derive(Debug, Clone)]
pub struct StaticAuthChecker {
    status: Option<DomainAuthStatus>,
}

impl StaticAuthChecker {
    #[must_use]
    pub fn new(status: DomainAuthStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    /// A checker whose lookups always error.
    #[must_use]
    pub fn failing() -> Self {
        Self { status: None }
    }
}

#[async_trait]
impl DomainAuthChecker for StaticAuthChecker {
    async fn check_auth(&self, domain: &str) -> Result<DomainAuthStatus, CheckerError> {
        self.status.clone().ok_or_else(|| CheckerError::LookupFailed {
            domain: domain.to_string(),
            message: "resolver timeout".to_string(),
        })
    }
}

/// Answers DNS health checks with a fixed result and counts lookups.
#[derive(Debug, Clone)]
pub struct StaticDnsChecker {
    health: DnsHealth,
    lookups: Arc<AtomicU64>,
}

impl StaticDnsChecker {
    #[must_use]
    pub fn new(health: DnsHealth) -> Self {
        Self {
            health,
            lookups: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Lookups performed so far.
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsHealthChecker for StaticDnsChecker {
    async fn check(&self, _domain: &str) -> Result<DnsHealth, CheckerError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.health.clone())
    }
}

/// Records sent emails, optionally failing some or all of them first.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutboundEmail>>>,
    failures_left: Arc<Mutex<u32>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing() -> Self {
        Self::failing_times(u32::MAX)
    }

    /// Fails the first `times` sends, then delivers.
    #[must_use]
    pub fn failing_times(times: u32) -> Self {
        Self {
            failures_left: Arc::new(Mutex::new(times)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        {
            let mut failures_left = self.failures_left.lock().unwrap();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(TransportError::Unavailable {
                    message: "connection reset".to_string(),
                });
            }
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Records deferred emails, optionally rejecting every one.
#[derive(Debug, Clone, Default)]
pub struct RecordingDeferredQueue {
    deferred: Arc<Mutex<Vec<DeferredEmail>>>,
    fail: bool,
}

impl RecordingDeferredQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn deferred(&self) -> Vec<DeferredEmail> {
        self.deferred.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeferredQueue for RecordingDeferredQueue {
    async fn enqueue(&self, email: &DeferredEmail) -> Result<String, QueueError> {
        if self.fail {
            return Err(QueueError::PublishFailed {
                message: "queue unavailable".to_string(),
            });
        }
        let mut deferred = self.deferred.lock().unwrap();
        deferred.push(email.clone());
        Ok(format!("deferred-{}", deferred.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StartWarmup;
    use amber_relay_core::{ManualClock, WorkspaceId};
    use chrono::{Duration, TimeZone};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    }

    fn record() -> WarmupDomain {
        let request = StartWarmup::new(WorkspaceId::new(), "example.com");
        WarmupDomain::start(&request, Utc::now())
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = InMemoryWarmupStore::new();
        let original = record();
        store.create(&original).await.unwrap();

        let updated = store.update(&original).await.unwrap();
        assert_eq!(updated.version, 1);

        let err = store.update(&original).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                domain: "example.com".to_string()
            }
        );
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = InMemoryWarmupStore::new();
        store.create(&record()).await.unwrap();
        assert!(matches!(
            store.create(&record()).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn daily_counters_expire_after_a_week() {
        let clock = clock();
        let store = InMemoryWarmupStore::new().with_clock(Arc::new(clock.clone()));
        let date = clock.now().date_naive();

        store.increment_daily("example.com", date, CounterKind::Send).await.unwrap();
        store.increment_daily("example.com", date, CounterKind::Send).await.unwrap();
        store.increment_daily("example.com", date, CounterKind::Bounce).await.unwrap();
        let counter = store.daily_counter("example.com", date).await.unwrap();
        assert_eq!(counter.send_count, 2);
        assert_eq!(counter.bounce_count, 1);

        clock.advance(Duration::days(7));
        let counter = store.daily_counter("example.com", date).await.unwrap();
        assert_eq!(counter, DailyCounter::default());
    }

    #[tokio::test]
    async fn hourly_counters_expire_after_two_days() {
        let clock = clock();
        let store = InMemoryWarmupStore::new().with_clock(Arc::new(clock.clone()));
        let date = clock.now().date_naive();

        assert_eq!(store.increment_hourly_send("example.com", date, 12).await.unwrap(), 1);
        assert_eq!(store.increment_hourly_send("example.com", date, 12).await.unwrap(), 2);
        assert_eq!(store.increment_hourly_send("example.com", date, 13).await.unwrap(), 1);

        clock.advance(Duration::hours(48));
        store.purge_expired();
        assert_eq!(store.hourly_counter_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryWarmupStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("example.com").await,
            Err(StoreError::Unavailable { .. })
        ));
    }
}
