//! Scheduler main loop: tick the evaluator, drain the control channel,
//! and periodically rescue jobs the broker appears to have lost.

use crate::api::server::{ApiContext, start_control_api};
use crate::api::{ControlMessage, SchedulerMetrics};
use crate::config::{BrokerCredentials, Config, StoreCredentials};
use crate::cron::Evaluator;
use crate::error::Result;
use crate::jobs::{CronSpec, JobRecord};
use crate::scheduler::publisher::{PublishRequest, PublisherPool};
use crate::store::{CRONS, JOBS, Store};

use anyhow::Context as _;
use bson::doc;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Redelivery scan cadence, in tick-loop iterations.
const REDELIVERY_SCAN_EVERY: u32 = 60;
/// A record is abandoned once it would need a fourth resend.
const MAX_RESEND_ATTEMPTS: u32 = 4;

/// Run the scheduler service until the shutdown signal fires.
pub async fn run(config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let broker_creds = BrokerCredentials::load(&config.secrets_dir)?;
    let store_creds = StoreCredentials::load(&config.secrets_dir)?;

    // The control API failing to come up is fatal: a scheduler nobody can
    // reach or scrape is worse than a crashed one.
    let (control_tx, mut control_rx) = mpsc::channel::<ControlMessage>(64);
    let api_context = Arc::new(ApiContext {
        control_tx,
        store: Store::new(
            "control-api",
            config.store.clone(),
            store_creds.clone(),
            config.tls(),
        ),
        metrics: SchedulerMetrics::new(),
    });
    let api_handle = start_control_api(
        config.api_bind,
        &config.tls(),
        api_context,
        shutdown_rx.clone(),
    )
    .await
    .context("failed to start control API")?;

    let pool = PublisherPool::start(
        config.publisher_pool_size,
        &config,
        &broker_creds,
        &store_creds,
    )
    .await?;

    let store = Store::new(
        "parent",
        config.store.clone(),
        store_creds.clone(),
        config.tls(),
    );
    store.ensure_indexes().await;

    let mut evaluator = Evaluator::new();
    evaluator.reload(load_enabled_crons(&store).await, Utc::now());

    tracing::info!("scheduler service started");

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = shutdown_rx;
    let mut iterations: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        // 1. Advance the evaluator; due specs become publish requests.
        let mut due: Vec<CronSpec> = Vec::new();
        evaluator.tick(Utc::now(), |spec| due.push(spec.clone()));
        for spec in due {
            pool.submit(PublishRequest::Cron(spec)).await;
        }

        // 2. Drain the control channel.
        let mut reload_requested = false;
        while let Ok(message) = control_rx.try_recv() {
            match message {
                ControlMessage::RunJob(submission) => {
                    tracing::info!(job = %submission.normalized_name(), "ad-hoc job accepted");
                    pool.submit(PublishRequest::Adhoc(submission)).await;
                }
                ControlMessage::JobUpdate => reload_requested = true,
            }
        }
        if reload_requested {
            evaluator.reload(load_enabled_crons(&store).await, Utc::now());
            tracing::info!("updated cron schedule");
        }

        // 3. Periodic redelivery scan.
        iterations += 1;
        if iterations >= REDELIVERY_SCAN_EVERY {
            iterations = 0;
            redelivery_scan(&store, &pool).await;
        }
    }

    tracing::info!("scheduler service stopping");
    pool.stop().await;
    let _ = api_handle.await;
    Ok(())
}

async fn load_enabled_crons(store: &Store) -> Vec<CronSpec> {
    store.find_all(CRONS, doc! {"disabled": false}).await
}

/// Re-publish pending records that later-scheduled completions have
/// overtaken. A pending record older than the newest completed one has very
/// likely been lost by the broker; anything else is just still in flight.
async fn redelivery_scan(store: &Store, pool: &PublisherPool) {
    let pending: Vec<JobRecord> = store.find_all(JOBS, doc! {"state": "pending"}).await;
    if pending.is_empty() {
        return;
    }
    let latest: Vec<JobRecord> = store
        .find_sorted(JOBS, doc! {"state": "completed"}, doc! {"scheduled": -1}, 1)
        .await;
    let Some(horizon) = latest.first().map(|record| record.scheduled) else {
        return;
    };

    let now = Utc::now();
    for mut record in pending {
        let Some(attempt) = resend_decision(&record, horizon, now) else {
            continue;
        };
        tracing::info!(
            job_id = %record.id,
            attempt,
            "resending job presumed lost"
        );
        record.resend_attempt = attempt;
        record.resent = now;
        pool.submit(PublishRequest::Resend(record)).await;
    }
}

/// Decide whether a pending record is due for a resend, and at which
/// attempt number. Backoff grows by one whole minute per attempt; after
/// three resends the record is left to history.
fn resend_decision(
    record: &JobRecord,
    horizon: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<u32> {
    if record.scheduled >= horizon {
        return None;
    }
    let attempt = record.resend_attempt + 1;
    if attempt >= MAX_RESEND_ATTEMPTS {
        return None;
    }
    if record.resent >= now - Duration::minutes(i64::from(attempt)) {
        return None;
    }
    Some(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InventoryBinding, JobState};

    fn pending(scheduled: DateTime<Utc>, resend_attempt: u32, resent: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: "j1".into(),
            cron_id: None,
            name: "stuck".into(),
            kind: "shell".into(),
            run_target: "test.sh".into(),
            args: vec![],
            host_inventory: InventoryBinding::default(),
            extra_vars: serde_json::Map::new(),
            state: JobState::Pending,
            result: None,
            errors: vec![],
            tasks: vec![],
            scheduled,
            start: None,
            end: None,
            resend_attempt,
            resent,
            expiry_time: scheduled + Duration::days(7),
        }
    }

    fn utc(value: &str) -> DateTime<Utc> {
        value.parse().expect("test timestamp should parse")
    }

    #[test]
    fn lost_record_is_resent_once_backoff_has_passed() {
        let t0 = utc("2025-03-10T12:00:00Z");
        let horizon = t0 + Duration::seconds(1);
        let now = t0 + Duration::seconds(61);

        let record = pending(t0, 0, t0);
        assert_eq!(resend_decision(&record, horizon, now), Some(1));
    }

    #[test]
    fn records_newer_than_the_horizon_are_left_alone() {
        let t0 = utc("2025-03-10T12:00:00Z");
        let record = pending(t0, 0, t0);
        // No completion has overtaken it yet: still in flight, not lost.
        assert_eq!(
            resend_decision(&record, t0, t0 + Duration::hours(1)),
            None
        );
    }

    #[test]
    fn backoff_grows_one_minute_per_attempt() {
        let t0 = utc("2025-03-10T12:00:00Z");
        let horizon = t0 + Duration::seconds(1);

        let record = pending(t0, 1, t0 + Duration::minutes(10));
        // Second resend needs two minutes since the last one.
        assert_eq!(
            resend_decision(&record, horizon, t0 + Duration::minutes(11)),
            None
        );
        assert_eq!(
            resend_decision(&record, horizon, t0 + Duration::minutes(12) + Duration::seconds(1)),
            Some(2)
        );
    }

    #[test]
    fn a_record_is_never_resent_more_than_three_times() {
        let t0 = utc("2025-03-10T12:00:00Z");
        let horizon = t0 + Duration::seconds(1);
        let now = t0 + Duration::days(1);

        assert_eq!(resend_decision(&pending(t0, 2, t0), horizon, now), Some(3));
        assert_eq!(resend_decision(&pending(t0, 3, t0), horizon, now), None);
    }
}
