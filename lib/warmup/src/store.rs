//! Warm-up record and counter storage.
//!
//! Records change only through version-checked updates and counters only
//! through atomic increments, so concurrent sends for the same domain never
//! lose a count or overwrite each other's transitions.

use crate::domain::WarmupDomain;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Lifetime of a daily counter after its first increment.
pub const DAILY_COUNTER_TTL: Duration = Duration::days(7);

/// Lifetime of an hourly counter after its first increment.
pub const HOURLY_COUNTER_TTL: Duration = Duration::hours(48);

/// One domain's activity on one UTC date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub send_count: u64,
    pub bounce_count: u64,
    pub complaint_count: u64,
    pub delivery_count: u64,
    pub open_count: u64,
    pub click_count: u64,
    pub reply_count: u64,
}

impl DailyCounter {
    /// Adds one to the field for `kind`, returning the new value.
    pub fn increment(&mut self, kind: CounterKind) -> u64 {
        let field = match kind {
            CounterKind::Send => &mut self.send_count,
            CounterKind::Bounce => &mut self.bounce_count,
            CounterKind::Complaint => &mut self.complaint_count,
            CounterKind::Delivery => &mut self.delivery_count,
            CounterKind::Open => &mut self.open_count,
            CounterKind::Click => &mut self.click_count,
            CounterKind::Reply => &mut self.reply_count,
        };
        *field += 1;
        *field
    }
}

/// Which daily counter an event increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Send,
    Bounce,
    Complaint,
    Delivery,
    Open,
    Click,
    Reply,
}

/// Keyed storage for warm-up records and their counters.
#[async_trait]
pub trait WarmupStore: Send + Sync {
    /// Loads the record for `domain`.
    async fn get(&self, domain: &str) -> Result<Option<WarmupDomain>, StoreError>;

    /// Inserts a new record, failing with `AlreadyExists` if one is present.
    async fn create(&self, record: &WarmupDomain) -> Result<(), StoreError>;

    /// Replaces the record if its stored version still equals
    /// `record.version`, returning the stored copy with the bumped version.
    async fn update(&self, record: &WarmupDomain) -> Result<WarmupDomain, StoreError>;

    /// Removes the record. Returns false if there was none.
    async fn delete(&self, domain: &str) -> Result<bool, StoreError>;

    /// All records in the active state.
    async fn list_active(&self) -> Result<Vec<WarmupDomain>, StoreError>;

    /// Atomically increments one daily counter, creating it on first use.
    async fn increment_daily(
        &self,
        domain: &str,
        date: NaiveDate,
        kind: CounterKind,
    ) -> Result<u64, StoreError>;

    /// Atomically increments the hourly send counter, creating it on first use.
    async fn increment_hourly_send(
        &self,
        domain: &str,
        date: NaiveDate,
        hour: u32,
    ) -> Result<u64, StoreError>;

    /// Reads a day's counters; zeros when none exist or they expired.
    async fn daily_counter(&self, domain: &str, date: NaiveDate) -> Result<DailyCounter, StoreError>;
}
