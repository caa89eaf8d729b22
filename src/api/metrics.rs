//! Scheduler metrics, refreshed from live store counts at scrape time.
//!
//! There are no in-process counters to keep consistent across restarts or
//! replicas: every scrape recomputes each value with a bounded count query
//! and writes it into the gauge before encoding. A store outage degrades
//! every count to zero rather than failing the scrape.

use crate::store::{CRONS, JOBS, Store};

use bson::doc;
use prometheus::{Encoder as _, IntGauge, Opts, Registry};

/// Prometheus handles for the scheduler scrape endpoint.
pub struct SchedulerMetrics {
    registry: Registry,
    jobs_total: IntGauge,
    jobs_pending: IntGauge,
    jobs_running: IntGauge,
    jobs_successful_total: IntGauge,
    jobs_failed_total: IntGauge,
    crons_total: IntGauge,
    crons_enabled_total: IntGauge,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_total = IntGauge::with_opts(Opts::new(
            "scheduler_jobs_total",
            "Total number of jobs submitted",
        ))
        .expect("hardcoded metric descriptor");

        let jobs_pending = IntGauge::with_opts(Opts::new(
            "scheduler_jobs_pending",
            "Current number of pending jobs waiting to be run",
        ))
        .expect("hardcoded metric descriptor");

        let jobs_running = IntGauge::with_opts(Opts::new(
            "scheduler_jobs_running",
            "Current number of running jobs",
        ))
        .expect("hardcoded metric descriptor");

        let jobs_successful_total = IntGauge::with_opts(Opts::new(
            "scheduler_jobs_successful_total",
            "Total number of successful jobs run",
        ))
        .expect("hardcoded metric descriptor");

        let jobs_failed_total = IntGauge::with_opts(Opts::new(
            "scheduler_jobs_failed_total",
            "Total number of failed jobs run",
        ))
        .expect("hardcoded metric descriptor");

        let crons_total = IntGauge::with_opts(Opts::new(
            "scheduler_crons_total",
            "Total number of crons",
        ))
        .expect("hardcoded metric descriptor");

        let crons_enabled_total = IntGauge::with_opts(Opts::new(
            "scheduler_crons_enabled_total",
            "Total number of enabled crons",
        ))
        .expect("hardcoded metric descriptor");

        for gauge in [
            &jobs_total,
            &jobs_pending,
            &jobs_running,
            &jobs_successful_total,
            &jobs_failed_total,
            &crons_total,
            &crons_enabled_total,
        ] {
            registry
                .register(Box::new(gauge.clone()))
                .expect("hardcoded metric");
        }

        Self {
            registry,
            jobs_total,
            jobs_pending,
            jobs_running,
            jobs_successful_total,
            jobs_failed_total,
            crons_total,
            crons_enabled_total,
        }
    }

    /// Refresh every gauge from live counts, then encode the exposition
    /// text. Each count runs under the store's scrape deadline.
    pub async fn scrape(&self, store: &Store) -> Option<String> {
        self.jobs_total.set(store.count(JOBS, doc! {}).await as i64);
        self.jobs_pending
            .set(store.count(JOBS, doc! {"state": "pending"}).await as i64);
        self.jobs_running
            .set(store.count(JOBS, doc! {"state": "running"}).await as i64);
        self.jobs_successful_total.set(
            store
                .count(JOBS, doc! {"state": "completed", "result": true})
                .await as i64,
        );
        self.jobs_failed_total.set(
            store
                .count(JOBS, doc! {"state": "completed", "result": false})
                .await as i64,
        );
        self.crons_total.set(store.count(CRONS, doc! {}).await as i64);
        self.crons_enabled_total
            .set(store.count(CRONS, doc! {"disabled": false}).await as i64);

        self.encode()
    }

    fn encode(&self) -> Option<String> {
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(%error, "failed to encode metrics");
            return None;
        }
        match String::from_utf8(buffer) {
            Ok(text) => Some(text),
            Err(error) => {
                tracing::warn!(%error, "metrics encoding produced invalid UTF-8");
                None
            }
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_has_help_type_and_sample_per_metric() {
        let metrics = SchedulerMetrics::new();
        metrics.jobs_total.set(12);
        metrics.jobs_pending.set(2);
        metrics.crons_enabled_total.set(3);

        let text = metrics.encode().expect("exposition should encode");
        for name in [
            "scheduler_jobs_total",
            "scheduler_jobs_pending",
            "scheduler_jobs_running",
            "scheduler_jobs_successful_total",
            "scheduler_jobs_failed_total",
            "scheduler_crons_total",
            "scheduler_crons_enabled_total",
        ] {
            assert!(text.contains(&format!("# HELP {name} ")), "missing HELP for {name}");
            assert!(text.contains(&format!("# TYPE {name} gauge")), "missing TYPE for {name}");
            assert!(
                text.lines().any(|line| line.starts_with(name)),
                "missing sample for {name}"
            );
        }
        assert!(text.contains("scheduler_jobs_total 12"));
        assert!(text.contains("scheduler_jobs_pending 2"));
        assert!(text.contains("scheduler_crons_enabled_total 3"));
    }
}
