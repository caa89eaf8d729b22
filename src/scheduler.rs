//! Scheduler service: the authoritative producer of job records.
//!
//! One instance owns the live schedule. It composes the store, the broker
//! publisher pool, the cron evaluator, and the control API; workers only
//! ever see job ids on the queue. Horizontal scale is deliberately
//! unsupported; the redelivery scan assumes a single writer of pending
//! state.

pub mod publisher;
pub mod service;

pub use publisher::{PublishRequest, PublisherPool};
pub use service::run;
