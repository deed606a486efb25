//! Long-wait scheduling for amber-relay.
//!
//! Waits longer than the work transport's maximum delay are registered here
//! with an absolute fire time. When due, the resume message is handed back
//! to the delay queue and the schedule is deleted.

pub mod store;
pub mod wake;

pub use store::{InMemoryWakeStore, WakeStore};
pub use wake::{CLAIM_LEASE, DEFAULT_BATCH_SIZE, FireReport, OneShotScheduler, ScheduledWake};
