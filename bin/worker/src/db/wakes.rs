//! Scheduled wake-up repository.

use amber_relay_core::WakeId;
use amber_relay_scheduler::{ScheduledWake, WakeStore};
use amber_relay_workflow::ScheduleError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

#[derive(FromRow)]
struct WakeRow {
    key: String,
    id: String,
    fire_at: DateTime<Utc>,
    message: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl WakeRow {
    fn try_into_wake(self) -> Result<ScheduledWake, ScheduleError> {
        let id = WakeId::from_str(&self.id).map_err(|e| ScheduleError::ScheduleFailed {
            message: format!("invalid wake id '{}': {e}", self.id),
        })?;
        let message = serde_json::from_value(self.message).map_err(|e| ScheduleError::ScheduleFailed {
            message: format!("invalid wake message for '{}': {e}", self.key),
        })?;
        Ok(ScheduledWake {
            id,
            key: self.key,
            fire_at: self.fire_at,
            message,
            created_at: self.created_at,
        })
    }
}

fn failed(e: sqlx::Error) -> ScheduleError {
    ScheduleError::ScheduleFailed {
        message: e.to_string(),
    }
}

/// Wake-ups in the `scheduled_wakes` table.
pub struct PgWakeStore {
    pool: PgPool,
}

impl PgWakeStore {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WakeStore for PgWakeStore {
    async fn insert(&self, wake: &ScheduledWake) -> Result<bool, ScheduleError> {
        let message = serde_json::to_value(&wake.message).map_err(|e| ScheduleError::ScheduleFailed {
            message: e.to_string(),
        })?;
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_wakes (key, id, fire_at, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&wake.key)
        .bind(wake.id.to_string())
        .bind(wake.fire_at)
        .bind(message)
        .bind(wake.created_at)
        .execute(&self.pool)
        .await
        .map_err(failed)?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: TimeDelta,
        limit: usize,
    ) -> Result<Vec<ScheduledWake>, ScheduleError> {
        let rows: Vec<WakeRow> = sqlx::query_as(
            r#"
            UPDATE scheduled_wakes
            SET claimed_until = $2
            WHERE key IN (
                SELECT key FROM scheduled_wakes
                WHERE fire_at <= $1
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY fire_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING key, id, fire_at, message, created_at
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(failed)?;

        let mut wakes = rows
            .into_iter()
            .map(WakeRow::try_into_wake)
            .collect::<Result<Vec<_>, _>>()?;
        wakes.sort_by_key(|wake| wake.fire_at);
        Ok(wakes)
    }

    async fn release(&self, key: &str) -> Result<(), ScheduleError> {
        sqlx::query("UPDATE scheduled_wakes SET claimed_until = NULL WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(failed)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, ScheduleError> {
        let result = sqlx::query("DELETE FROM scheduled_wakes WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(failed)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<ScheduledWake>, ScheduleError> {
        let row: Option<WakeRow> = sqlx::query_as(
            r#"
            SELECT key, id, fire_at, message, created_at
            FROM scheduled_wakes
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(failed)?;

        row.map(WakeRow::try_into_wake).transpose()
    }

    async fn count(&self) -> Result<u64, ScheduleError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scheduled_wakes")
            .fetch_one(&self.pool)
            .await
            .map_err(failed)?;
        Ok(super::to_u64(count))
    }
}
