//! Orchestration runner invocation.
//!
//! Every job ultimately runs as a playbook: `orch` jobs bring their own,
//! script jobs go through the generic wrapper playbook with the script
//! file, type, and args passed as extra variables. The runner itself is an
//! external process; each invocation gets a fresh scratch directory, a
//! staged inventory file, and the runner environment, and streams one JSON
//! event per line back on stdout.

use crate::error::RunnerError;
use crate::jobs::{JobKind, JobRecord, TaskOutcome};

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt as _, BufReader};

/// Wrapper playbook used for every non-`orch` job.
const SCRIPT_WRAPPER_PLAYBOOK: &str = "run_job_script.yml";

/// Process-wide runner settings, derived from config at service start.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub playbook_dir: PathBuf,
    pub config_file: PathBuf,
    pub interpreter: PathBuf,
    pub private_key: PathBuf,
}

impl RunnerSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            playbook_dir: config.playbook_dir(),
            config_file: config.runner_config(),
            interpreter: PathBuf::from("/usr/bin/python3"),
            private_key: config.runner_private_key(),
        }
    }
}

/// Everything the worker needs from one finished run.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub rc: i32,
    pub tasks: Vec<TaskOutcome>,
    pub errors: Vec<String>,
}

/// Resolved invocation inputs for one job.
#[derive(Debug, PartialEq)]
pub(crate) struct RunPlan {
    pub playbook: PathBuf,
    pub extra_vars: serde_json::Map<String, Value>,
}

/// Pick the playbook and extra vars for a record. `orch` jobs run their
/// own playbook with the job's extra vars; script jobs run the wrapper
/// playbook whose extra vars *replace* the job's with the script triple.
pub(crate) fn plan(
    settings: &RunnerSettings,
    record: &JobRecord,
) -> Result<RunPlan, crate::error::SpecError> {
    let script_type = JobKind::resolve(&record.kind, &record.run_target)?;
    if script_type == JobKind::Orch {
        return Ok(RunPlan {
            playbook: settings.playbook_dir.join(&record.run_target),
            extra_vars: record.extra_vars.clone(),
        });
    }

    let mut extra_vars = serde_json::Map::new();
    extra_vars.insert("script_file".into(), Value::from(record.run_target.clone()));
    extra_vars.insert("script_type".into(), Value::from(script_type.as_str()));
    extra_vars.insert(
        "script_args".into(),
        Value::from(record.args.clone()),
    );
    Ok(RunPlan {
        playbook: settings.playbook_dir.join(SCRIPT_WRAPPER_PLAYBOOK),
        extra_vars,
    })
}

/// Execute one job to completion and collect its task outcomes. Blocks for
/// the full runner duration; there is deliberately no timeout here.
pub(crate) async fn execute(
    settings: &RunnerSettings,
    record: &JobRecord,
    plan: RunPlan,
) -> Result<RunOutcome, RunnerError> {
    let scratch = tempfile::Builder::new()
        .prefix(&format!("job-{}-", record.id))
        .tempdir()
        .map_err(RunnerError::Stage)?;

    let inventory_path = scratch.path().join("inventory.json");
    stage_json(&inventory_path, &record.host_inventory.to_runner_inventory())?;

    let extra_vars_path = scratch.path().join("extravars.json");
    stage_json(&extra_vars_path, &Value::Object(plan.extra_vars))?;

    let mut child = tokio::process::Command::new("ansible-runner")
        .arg("run")
        .arg(scratch.path())
        .arg("-p")
        .arg(&plan.playbook)
        .arg("--inventory")
        .arg(&inventory_path)
        .arg("--extravars")
        .arg(&extra_vars_path)
        .arg("-j")
        .env("ANSIBLE_CONFIG", &settings.config_file)
        .env("ANSIBLE_PYTHON_INTERPRETER", &settings.interpreter)
        .env("ANSIBLE_PRIVATE_KEY_FILE", &settings.private_key)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(RunnerError::Spawn)?;

    let mut outcome = RunOutcome::default();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(event) = parse_event(&line) {
                if event.failed {
                    outcome.errors.push(event.failure_message());
                }
                outcome.tasks.push(event.outcome);
            }
        }
    }

    let status = child.wait().await.map_err(RunnerError::Spawn)?;
    outcome.rc = status.code().ok_or(RunnerError::NoExitStatus)?;
    Ok(outcome)
}

fn stage_json(path: &Path, value: &Value) -> Result<(), RunnerError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|error| RunnerError::Stage(std::io::Error::other(error)))?;
    std::fs::write(path, bytes).map_err(RunnerError::Stage)
}

/// One task-level event pulled off the runner's JSON stream.
#[derive(Debug)]
pub(crate) struct RunnerEvent {
    pub outcome: TaskOutcome,
    pub failed: bool,
    /// Raw stderr text of the step, preferred over `msg` in error strings.
    stderr_text: String,
}

impl RunnerEvent {
    /// Error string recorded on the job for a failed step.
    pub(crate) fn failure_message(&self) -> String {
        let detail = if self.stderr_text.is_empty() {
            &self.outcome.msg
        } else {
            &self.stderr_text
        };
        format!(
            "Task: {}, Host: {}, Error: {}",
            self.outcome.task, self.outcome.host, detail
        )
    }
}

/// Parse one stdout line. Only task-ok and task-failed events produce an
/// outcome; everything else on the stream is ignored.
pub(crate) fn parse_event(line: &str) -> Option<RunnerEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let failed = match value.get("event")?.as_str()? {
        "runner_on_ok" => false,
        "runner_on_failed" => true,
        _ => return None,
    };

    let data = value.get("event_data").cloned().unwrap_or_default();
    let res = data.get("res").cloned().unwrap_or_default();

    let outcome = TaskOutcome {
        task: string_field(&data, "task", "Unknown"),
        host: string_field(&data, "host", "Unknown"),
        rc: res.get("rc").and_then(Value::as_i64).unwrap_or(-1) as i32,
        cmd: string_list(&res, "cmd"),
        stdout: string_list(&res, "stdout_lines"),
        stderr: string_list(&res, "stderr_lines"),
        msg: string_field(&res, "msg", ""),
    };
    let stderr_text = string_field(&res, "stderr", "");
    Some(RunnerEvent {
        outcome,
        failed,
        stderr_text,
    })
}

fn string_field(value: &Value, key: &str, default: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// A field that is sometimes a string and sometimes a list of strings.
fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(item)) => vec![item.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InventoryBinding, JobState};
    use chrono::Utc;

    fn settings() -> RunnerSettings {
        RunnerSettings {
            playbook_dir: PathBuf::from("/app/ansible/playbooks"),
            config_file: PathBuf::from("/app/ansible/ansible.cfg"),
            interpreter: PathBuf::from("/usr/bin/python3"),
            private_key: PathBuf::from("/app/ansible/.env/.ansible_rsa"),
        }
    }

    fn record(kind: &str, run_target: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: "j1".into(),
            cron_id: None,
            name: "test".into(),
            kind: kind.into(),
            run_target: run_target.into(),
            args: vec!["0".into()],
            host_inventory: InventoryBinding::default(),
            extra_vars: serde_json::Map::new(),
            state: JobState::Pending,
            result: None,
            errors: vec![],
            tasks: vec![],
            scheduled: now,
            start: None,
            end: None,
            resend_attempt: 0,
            resent: now,
            expiry_time: now,
        }
    }

    #[test]
    fn orch_jobs_use_their_own_playbook_and_vars() {
        let mut orch = record("orch", "noop.yml");
        orch.extra_vars
            .insert("region".into(), Value::from("us-east"));

        let plan = plan(&settings(), &orch).expect("plan should resolve");
        assert_eq!(
            plan.playbook,
            PathBuf::from("/app/ansible/playbooks/noop.yml")
        );
        assert_eq!(plan.extra_vars.get("region"), Some(&Value::from("us-east")));
    }

    #[test]
    fn script_jobs_use_the_wrapper_with_replaced_vars() {
        let mut script = record("shell", "test.sh");
        script
            .extra_vars
            .insert("ignored".into(), Value::from(true));

        let plan = plan(&settings(), &script).expect("plan should resolve");
        assert_eq!(
            plan.playbook,
            PathBuf::from("/app/ansible/playbooks/run_job_script.yml")
        );
        assert_eq!(
            plan.extra_vars.get("script_file"),
            Some(&Value::from("test.sh"))
        );
        assert_eq!(
            plan.extra_vars.get("script_type"),
            Some(&Value::from("shell"))
        );
        assert_eq!(
            plan.extra_vars.get("script_args"),
            Some(&Value::from(vec!["0".to_string()]))
        );
        // The wrapper vars replace the job's own, never merge with them.
        assert!(plan.extra_vars.get("ignored").is_none());
    }

    #[test]
    fn unknown_kind_falls_back_to_suffix_inference() {
        let plan = plan(&settings(), &record("", "script.py")).expect("plan should resolve");
        assert_eq!(
            plan.extra_vars.get("script_type"),
            Some(&Value::from("python"))
        );
    }

    #[test]
    fn uninferable_script_type_is_an_error() {
        assert!(plan(&settings(), &record("", "mystery.bin")).is_err());
    }

    #[test]
    fn parse_event_extracts_ok_tasks() {
        let line = r#"{"event":"runner_on_ok","event_data":{"task":"run script","host":"localhost","res":{"rc":0,"cmd":["/bin/sh","test.sh"],"stdout_lines":["hello"],"stderr_lines":[]}}}"#;
        let event = parse_event(line).expect("event should parse");
        assert!(!event.failed);
        assert_eq!(event.outcome.task, "run script");
        assert_eq!(event.outcome.host, "localhost");
        assert_eq!(event.outcome.rc, 0);
        assert_eq!(event.outcome.cmd, vec!["/bin/sh", "test.sh"]);
        assert_eq!(event.outcome.stdout, vec!["hello"]);
    }

    #[test]
    fn parse_event_formats_failure_messages() {
        let line = r#"{"event":"runner_on_failed","event_data":{"task":"run script","host":"h1","res":{"rc":2,"stderr":"boom","msg":"non-zero return code"}}}"#;
        let event = parse_event(line).expect("event should parse");
        assert!(event.failed);
        assert_eq!(
            event.failure_message(),
            "Task: run script, Host: h1, Error: boom"
        );

        // Without stderr text the formatted message falls back to msg.
        let line = r#"{"event":"runner_on_failed","event_data":{"task":"t","host":"h","res":{"msg":"unreachable"}}}"#;
        let event = parse_event(line).expect("event should parse");
        assert_eq!(event.outcome.rc, -1);
        assert_eq!(event.failure_message(), "Task: t, Host: h, Error: unreachable");
    }

    #[test]
    fn parse_event_ignores_non_task_events() {
        assert!(parse_event(r#"{"event":"playbook_on_start"}"#).is_none());
        assert!(parse_event("not json").is_none());
        assert!(parse_event(r#"{"no_event":true}"#).is_none());
    }

    #[test]
    fn cmd_accepts_string_or_list() {
        let line = r#"{"event":"runner_on_ok","event_data":{"task":"t","host":"h","res":{"cmd":"/bin/true"}}}"#;
        let event = parse_event(line).expect("event should parse");
        assert_eq!(event.outcome.cmd, vec!["/bin/true"]);
    }
}
