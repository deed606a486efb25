//! Warm-up record and counter repository.

use super::{to_i64, to_u64};
use amber_relay_core::{Clock, SystemClock};
use amber_relay_warmup::store::{DAILY_COUNTER_TTL, HOURLY_COUNTER_TTL};
use amber_relay_warmup::{
    CounterKind, DailyCounter, StoreError, WarmupDomain, WarmupStatus, WarmupStore,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;

#[derive(FromRow)]
struct DomainRow {
    domain: String,
    record: serde_json::Value,
}

impl DomainRow {
    fn try_into_record(self) -> Result<WarmupDomain, StoreError> {
        serde_json::from_value(self.record).map_err(|e| StoreError::Unavailable {
            message: format!("invalid warm-up record for {}: {e}", self.domain),
        })
    }
}

#[derive(FromRow)]
struct DailyRow {
    send_count: i64,
    bounce_count: i64,
    complaint_count: i64,
    delivery_count: i64,
    open_count: i64,
    click_count: i64,
    reply_count: i64,
}

impl From<DailyRow> for DailyCounter {
    fn from(row: DailyRow) -> Self {
        Self {
            send_count: to_u64(row.send_count),
            bounce_count: to_u64(row.bounce_count),
            complaint_count: to_u64(row.complaint_count),
            delivery_count: to_u64(row.delivery_count),
            open_count: to_u64(row.open_count),
            click_count: to_u64(row.click_count),
            reply_count: to_u64(row.reply_count),
        }
    }
}

/// Column in `warmup_daily_counters` holding `kind`.
fn counter_column(kind: CounterKind) -> &'static str {
    match kind {
        CounterKind::Send => "send_count",
        CounterKind::Bounce => "bounce_count",
        CounterKind::Complaint => "complaint_count",
        CounterKind::Delivery => "delivery_count",
        CounterKind::Open => "open_count",
        CounterKind::Click => "click_count",
        CounterKind::Reply => "reply_count",
    }
}

const DAILY_COLUMNS: [&str; 7] = [
    "send_count",
    "bounce_count",
    "complaint_count",
    "delivery_count",
    "open_count",
    "click_count",
    "reply_count",
];

/// Upsert that adds one to `column` and returns its new value. An expired
/// row is reset before the increment.
fn increment_daily_sql(column: &'static str) -> String {
    let assignments: Vec<String> = DAILY_COLUMNS
        .iter()
        .map(|name| {
            let live = if *name == column {
                format!("c.{name} + 1")
            } else {
                format!("c.{name}")
            };
            let reset = if *name == column { "1" } else { "0" };
            format!("{name} = CASE WHEN c.expires_at <= $4 THEN {reset} ELSE {live} END")
        })
        .collect();
    format!(
        r#"
        INSERT INTO warmup_daily_counters AS c (domain, day, {column}, expires_at)
        VALUES ($1, $2, 1, $3)
        ON CONFLICT (domain, day) DO UPDATE SET
            {assignments},
            expires_at = CASE WHEN c.expires_at <= $4 THEN EXCLUDED.expires_at ELSE c.expires_at END
        RETURNING {column}
        "#,
        assignments = assignments.join(",\n            ")
    )
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        message: e.to_string(),
    }
}

fn encode(record: &WarmupDomain) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::Unavailable {
        message: e.to_string(),
    })
}

/// Warm-up state in the `warmup_*` tables.
pub struct PgWarmupStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgWarmupStore {
    /// Creates a new repository on the system clock.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Deletes counters past their expiry. Returns the rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn purge_expired_counters(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let daily = sqlx::query("DELETE FROM warmup_daily_counters WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        let hourly = sqlx::query("DELETE FROM warmup_hourly_counters WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(daily.rows_affected() + hourly.rows_affected())
    }
}

#[async_trait]
impl WarmupStore for PgWarmupStore {
    async fn get(&self, domain: &str) -> Result<Option<WarmupDomain>, StoreError> {
        let row: Option<DomainRow> = sqlx::query_as(
            r#"
            SELECT domain, record
            FROM warmup_domains
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(DomainRow::try_into_record).transpose()
    }

    async fn create(&self, record: &WarmupDomain) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO warmup_domains (domain, workspace_id, status, version, record, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (domain) DO NOTHING
            "#,
        )
        .bind(&record.domain)
        .bind(record.workspace_id.to_string())
        .bind(record.status.as_str())
        .bind(to_i64(record.version))
        .bind(encode(record)?)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                domain: record.domain.clone(),
            });
        }
        Ok(())
    }

    async fn update(&self, record: &WarmupDomain) -> Result<WarmupDomain, StoreError> {
        let mut updated = record.clone();
        updated.version += 1;
        updated.updated_at = self.clock.now();

        let row: Option<DomainRow> = sqlx::query_as(
            r#"
            UPDATE warmup_domains
            SET status = $2, version = $3, record = $4, updated_at = $5
            WHERE domain = $1 AND version = $6
            RETURNING domain, record
            "#,
        )
        .bind(&record.domain)
        .bind(updated.status.as_str())
        .bind(to_i64(updated.version))
        .bind(encode(&updated)?)
        .bind(updated.updated_at)
        .bind(to_i64(record.version))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            Some(row) => row.try_into_record(),
            None if self.get(&record.domain).await?.is_some() => Err(StoreError::Conflict {
                domain: record.domain.clone(),
            }),
            None => Err(StoreError::NotFound {
                domain: record.domain.clone(),
            }),
        }
    }

    async fn delete(&self, domain: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM warmup_domains WHERE domain = $1")
            .bind(domain)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self) -> Result<Vec<WarmupDomain>, StoreError> {
        let rows: Vec<DomainRow> = sqlx::query_as(
            r#"
            SELECT domain, record
            FROM warmup_domains
            WHERE status = $1
            ORDER BY domain
            "#,
        )
        .bind(WarmupStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter().map(DomainRow::try_into_record).collect()
    }

    async fn increment_daily(
        &self,
        domain: &str,
        date: NaiveDate,
        kind: CounterKind,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let sql = increment_daily_sql(counter_column(kind));
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(domain)
            .bind(date)
            .bind(now + DAILY_COUNTER_TTL)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(to_u64(count))
    }

    async fn increment_hourly_send(
        &self,
        domain: &str,
        date: NaiveDate,
        hour: u32,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO warmup_hourly_counters AS c (domain, day, hour, send_count, expires_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (domain, day, hour) DO UPDATE SET
                send_count = CASE WHEN c.expires_at <= $5 THEN 1 ELSE c.send_count + 1 END,
                expires_at = CASE WHEN c.expires_at <= $5 THEN EXCLUDED.expires_at ELSE c.expires_at END
            RETURNING send_count
            "#,
        )
        .bind(domain)
        .bind(date)
        .bind(i32::try_from(hour).unwrap_or(i32::MAX))
        .bind(now + HOURLY_COUNTER_TTL)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(to_u64(count))
    }

    async fn daily_counter(&self, domain: &str, date: NaiveDate) -> Result<DailyCounter, StoreError> {
        let row: Option<DailyRow> = sqlx::query_as(
            r#"
            SELECT send_count, bounce_count, complaint_count, delivery_count,
                   open_count, click_count, reply_count
            FROM warmup_daily_counters
            WHERE domain = $1 AND day = $2 AND expires_at > $3
            "#,
        )
        .bind(domain)
        .bind(date)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(DailyCounter::from).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_counter_kind_has_its_own_column() {
        let kinds = [
            CounterKind::Send,
            CounterKind::Bounce,
            CounterKind::Complaint,
            CounterKind::Delivery,
            CounterKind::Open,
            CounterKind::Click,
            CounterKind::Reply,
        ];
        let mut columns: Vec<_> = kinds.iter().map(|kind| counter_column(*kind)).collect();
        columns.sort_unstable();
        columns.dedup();
        assert_eq!(columns.len(), kinds.len());
        assert!(columns.iter().all(|column| DAILY_COLUMNS.contains(column)));
    }

    #[test]
    fn increment_returns_the_incremented_column() {
        let sql = increment_daily_sql(counter_column(CounterKind::Bounce));
        assert!(sql.contains("(domain, day, bounce_count, expires_at)"));
        assert!(sql.trim_end().ends_with("RETURNING bounce_count"));
        assert!(sql.contains("bounce_count = CASE WHEN c.expires_at <= $4 THEN 1 ELSE c.bounce_count + 1 END"));
        assert!(sql.contains("send_count = CASE WHEN c.expires_at <= $4 THEN 0 ELSE c.send_count END"));
    }

    #[test]
    fn counter_rows_convert() {
        let counter = DailyCounter::from(DailyRow {
            send_count: 40,
            bounce_count: 2,
            complaint_count: 0,
            delivery_count: 37,
            open_count: 11,
            click_count: 3,
            reply_count: 1,
        });
        assert_eq!(counter.send_count, 40);
        assert_eq!(counter.delivery_count, 37);
        assert_eq!(counter.reply_count, 1);
    }
}
