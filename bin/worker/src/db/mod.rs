//! Postgres-backed stores for the worker's durable state.
//!
//! - Workflow runs, with a revision-checked update for every transition
//! - Long-wait wake-ups, claimed with `FOR UPDATE SKIP LOCKED`
//! - Email warm-up records and their expiring counters
//!
//! Records are kept whole in a `record` JSONB column next to the columns
//! the queries filter and compare on.

pub mod runs;
pub mod wakes;
pub mod warmup;

pub use runs::PgRunStore;
pub use wakes::PgWakeStore;
pub use warmup::PgWarmupStore;

/// Converts a count or version to the `BIGINT` column type.
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts a `BIGINT` column back to an unsigned count.
pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
