//! Job data model: cron declarations and materialized invocations.

pub mod record;
pub mod spec;

pub use record::{JobRecord, JobState, TaskOutcome};
pub use spec::{AtTime, CronSpec, Frequency, InventoryBinding, JobKind};
