//! Control API: ad-hoc job submission, schedule invalidation, metrics.
//!
//! The HTTP server is isolated from the scheduler loop; the only thing that
//! crosses the boundary is a typed `ControlMessage` channel. Request bodies
//! are parsed here and rejected here; the scheduler never sees raw JSON.

pub mod metrics;
pub mod server;

pub use metrics::SchedulerMetrics;

use crate::jobs::{InventoryBinding, JobRecord, JobState};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Messages injected into the scheduler loop by the control API.
#[derive(Debug)]
pub enum ControlMessage {
    /// Materialize and publish an ad-hoc job now.
    RunJob(JobSubmission),
    /// The cron set changed; reload the schedule from the store.
    JobUpdate,
}

/// Body of `POST /run-job`.
///
/// `wait` is accepted for front-end symmetry but the service ignores it:
/// waiting on completion is the submitting client's loop over the job
/// result projection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    /// Pre-assigned id, when the submitter wants to poll for the result.
    #[serde(default, rename = "_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    pub run_target: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub host_inventory: InventoryBinding,
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub wait: bool,
}

impl JobSubmission {
    /// The job name, defaulted from kind and run target when absent.
    pub fn normalized_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("manual-{}-{}", self.kind, self.run_target),
        }
    }

    /// Materialize a fresh pending record for this submission. A fresh id
    /// is assigned unless the submitter provided one.
    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        let name = self.normalized_name();
        JobRecord {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            cron_id: None,
            name,
            kind: self.kind,
            run_target: self.run_target,
            args: self.args,
            host_inventory: self.host_inventory,
            extra_vars: self.extra_vars,
            state: JobState::Pending,
            result: None,
            errors: Vec::new(),
            tasks: Vec::new(),
            scheduled: now,
            start: None,
            end: None,
            resend_attempt: 0,
            resent: now,
            expiry_time: now + Duration::days(7),
        }
    }
}
