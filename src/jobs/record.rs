//! Materialized job invocations and their state machine.
//!
//! A `JobRecord` is created by the scheduler in `pending`, claimed by exactly
//! one worker which moves it through `running` to `completed`, and is
//! read-only history afterwards. Transitions are checked before persistence;
//! an illegal transition is a bug upstream, not something to write through.

use crate::jobs::spec::{CronSpec, InventoryBinding};

use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a job record is retained before the store TTL index reaps it.
const RETENTION_DAYS: i64 = 7;

/// Job record lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
        }
    }

    /// States advance monotonically; the observed sequence for any record is
    /// a prefix of pending -> running -> completed.
    pub fn can_transition(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running) | (JobState::Running, JobState::Completed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one runner sub-step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: String,
    pub host: String,
    pub rc: i32,
    pub cmd: Vec<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub msg: String,
}

/// One materialized invocation, stored in the `jobs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub cron_id: Option<String>,
    pub name: String,
    /// Declared kind. Kept as the raw string: ad-hoc submissions may carry
    /// an unknown kind that is resolved from the run target at execution.
    pub kind: String,
    pub run_target: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub host_inventory: InventoryBinding,
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    pub state: JobState,
    #[serde(default)]
    pub result: Option<bool>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskOutcome>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub scheduled: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub start: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub end: Option<DateTime<Utc>>,
    pub resend_attempt: u32,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub resent: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expiry_time: DateTime<Utc>,
}

impl JobRecord {
    /// Materialize a fresh pending record from a cron spec firing.
    pub fn from_spec(spec: &CronSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cron_id: Some(spec.id.clone()),
            name: spec.name.clone(),
            kind: spec.kind.as_str().to_string(),
            run_target: spec.run_target.clone(),
            args: spec.args.clone(),
            host_inventory: spec.host_inventory.clone(),
            extra_vars: spec.extra_vars.clone(),
            state: JobState::Pending,
            result: None,
            errors: Vec::new(),
            tasks: Vec::new(),
            scheduled: now,
            start: None,
            end: None,
            resend_attempt: 0,
            resent: now,
            expiry_time: now + Duration::days(RETENTION_DAYS),
        }
    }

    /// Claim the record for execution. Fails unless the record is pending.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition(JobState::Running) {
            return false;
        }
        self.state = JobState::Running;
        self.start = Some(now);
        true
    }

    /// Finalize the record with the runner verdict. Fails unless running.
    pub fn mark_completed(&mut self, result: bool, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition(JobState::Completed) {
            return false;
        }
        self.state = JobState::Completed;
        self.end = Some(now);
        self.result = Some(result);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::spec::{Frequency, JobKind};

    fn spec() -> CronSpec {
        CronSpec {
            id: "c1".into(),
            name: "heartbeat".into(),
            kind: JobKind::Shell,
            run_target: "test.sh".into(),
            args: vec!["0".into()],
            frequency: Frequency::Second,
            interval: Some(5),
            at: None,
            timezone: "UTC".into(),
            host_inventory: InventoryBinding::default(),
            extra_vars: serde_json::Map::new(),
            disabled: false,
        }
    }

    #[test]
    fn state_sequence_is_a_prefix_of_the_lifecycle() {
        assert!(JobState::Pending.can_transition(JobState::Running));
        assert!(JobState::Running.can_transition(JobState::Completed));
        assert!(!JobState::Pending.can_transition(JobState::Completed));
        assert!(!JobState::Completed.can_transition(JobState::Running));
        assert!(!JobState::Completed.can_transition(JobState::Pending));
        assert!(!JobState::Running.can_transition(JobState::Pending));
    }

    #[test]
    fn materialized_record_starts_pending() {
        let now = Utc::now();
        let record = JobRecord::from_spec(&spec(), now);
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.cron_id.as_deref(), Some("c1"));
        assert_eq!(record.kind, "shell");
        assert_eq!(record.result, None);
        assert_eq!(record.resend_attempt, 0);
        assert_eq!(record.scheduled, now);
        assert_eq!(record.resent, now);
        assert_eq!(record.expiry_time, now + Duration::days(7));
        assert!(record.errors.is_empty() && record.tasks.is_empty());
    }

    #[test]
    fn lifecycle_methods_enforce_transitions() {
        let now = Utc::now();
        let mut record = JobRecord::from_spec(&spec(), now);

        // completed before running is refused
        assert!(!record.mark_completed(true, now));
        assert_eq!(record.state, JobState::Pending);

        assert!(record.mark_running(now));
        assert_eq!(record.start, Some(now));

        // double-claim is refused
        assert!(!record.mark_running(now));

        let later = now + Duration::seconds(2);
        assert!(record.mark_completed(true, later));
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.result, Some(true));
        assert!(record.end.expect("end is set") >= record.start.expect("start is set"));
    }

    #[test]
    fn record_bson_round_trip_uses_wire_names() {
        let now = Utc::now();
        let record = JobRecord::from_spec(&spec(), now);
        let doc = bson::to_document(&record).expect("record should encode");
        assert!(doc.contains_key("_id"));
        assert!(doc.contains_key("resendAttempt"));
        assert!(doc.contains_key("expiryTime"));
        assert_eq!(doc.get_str("state").expect("state is a string"), "pending");
        // unset start/end are absent, not null
        assert!(!doc.contains_key("start"));

        let back: JobRecord = bson::from_document(doc).expect("record should decode");
        assert_eq!(back.id, record.id);
        assert_eq!(back.state, JobState::Pending);
    }
}
