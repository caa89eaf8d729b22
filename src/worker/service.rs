//! Worker pool: each member owns its own store client and broker consumer.
//!
//! Every member runs the same loop: receive a job id, load and claim the
//! record, execute it, persist the outcome, ack. Claiming is guarded by the
//! state machine: a record that is not `pending` was already handled by
//! someone, so a redelivered id is logged and acked with no side effect.

use crate::broker::{Broker, Delivery};
use crate::config::{BrokerCredentials, Config, StoreCredentials};
use crate::error::Result;
use crate::jobs::{JobRecord, JobState};
use crate::store::{JOBS, Store};
use crate::worker::runner::{self, RunnerSettings};

use anyhow::anyhow;
use bson::doc;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

const SHUTDOWN_JOIN: std::time::Duration = std::time::Duration::from_secs(1);

/// Everything one worker member owns. Passed explicitly into the loop;
/// nothing here is process-global.
struct WorkerContext {
    id: String,
    store: Store,
    broker: Broker,
    runner: RunnerSettings,
}

/// Run the worker service until the shutdown signal fires.
pub async fn run(config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let broker_creds = BrokerCredentials::load(&config.secrets_dir)?;
    let store_creds = StoreCredentials::load(&config.secrets_dir)?;
    let runner_settings = RunnerSettings::from_config(&config);

    let mut members = Vec::with_capacity(config.worker_pool_size);
    for _ in 0..config.worker_pool_size {
        let member_id = crate::short_id();
        tracing::info!(client_id = %member_id, "initializing worker");

        let store = Store::new(
            member_id.clone(),
            config.store.clone(),
            store_creds.clone(),
            config.tls(),
        );
        let broker = Broker::start(
            member_id.clone(),
            config.broker.clone(),
            broker_creds.clone(),
            config.tls(),
        )
        .await?;

        // Bounded to the prefetch window so back-pressure reaches the broker.
        let (sink, deliveries) = mpsc::channel::<Delivery>(3);
        if !broker.consume(sink).await {
            return Err(anyhow!("[{member_id}] failed to start job consumer").into());
        }

        let context = WorkerContext {
            id: member_id,
            store,
            broker,
            runner: runner_settings.clone(),
        };
        members.push(tokio::spawn(member_loop(
            context,
            deliveries,
            shutdown_rx.clone(),
        )));
    }

    tracing::info!(members = members.len(), "worker service started");

    let mut shutdown = shutdown_rx;
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    tracing::info!("worker service stopping");
    for member in members {
        if tokio::time::timeout(SHUTDOWN_JOIN, member).await.is_err() {
            tracing::warn!("worker member did not stop in time");
        }
    }
    Ok(())
}

async fn member_loop(
    context: WorkerContext,
    mut deliveries: mpsc::Receiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                handle_delivery(&context, delivery).await;
            }
        }
    }
    context.broker.stop().await;
    tracing::info!(client_id = %context.id, "worker member stopped");
}

/// Process one delivered job id end to end, then ack. Only the happy path
/// mutates the record; tombstones and duplicates are absorbed here.
async fn handle_delivery(context: &WorkerContext, delivery: Delivery) {
    let job_id = String::from_utf8_lossy(&delivery.body).to_string();

    match context.store.job_state(&job_id).await {
        None => {
            // Tombstone: the id exists on the queue but not in the store.
            tracing::error!(client_id = %context.id, %job_id, "job not found in store");
            delivery.ack().await;
            return;
        }
        Some(JobState::Pending) => {}
        Some(state) => {
            tracing::info!(
                client_id = %context.id,
                %job_id,
                %state,
                "job already running or handled"
            );
            delivery.ack().await;
            return;
        }
    }

    let Some(mut record) = context
        .store
        .find_one::<JobRecord>(JOBS, doc! {"_id": &job_id})
        .await
    else {
        tracing::error!(client_id = %context.id, %job_id, "job not found in store");
        delivery.ack().await;
        return;
    };

    // The state may have moved between the projection check and the full
    // load; the claim below is the authoritative gate.
    if record.state != JobState::Pending {
        tracing::info!(
            client_id = %context.id,
            %job_id,
            state = %record.state,
            "job already running or handled"
        );
        delivery.ack().await;
        return;
    }

    execute_job(context, &mut record).await;
    delivery.ack().await;
}

async fn execute_job(context: &WorkerContext, record: &mut JobRecord) {
    tracing::info!(
        client_id = %context.id,
        job = %record.name,
        job_id = %record.id,
        "running job"
    );

    if !record.mark_running(Utc::now()) {
        tracing::error!(client_id = %context.id, job_id = %record.id, "refusing illegal claim");
        return;
    }
    if !persist(context, record).await {
        tracing::error!(
            client_id = %context.id,
            job_id = %record.id,
            "failed to persist running state"
        );
    }

    match runner::plan(&context.runner, record) {
        Ok(plan) => match runner::execute(&context.runner, record, plan).await {
            Ok(outcome) => {
                let succeeded = outcome.rc == 0;
                record.tasks = outcome.tasks;
                record.errors.extend(outcome.errors);
                record.mark_completed(succeeded, Utc::now());
                if succeeded {
                    tracing::info!(
                        client_id = %context.id,
                        job = %record.name,
                        job_id = %record.id,
                        "job completed successfully"
                    );
                } else {
                    tracing::error!(
                        client_id = %context.id,
                        job = %record.name,
                        job_id = %record.id,
                        rc = outcome.rc,
                        "job failed"
                    );
                }
            }
            Err(error) => {
                tracing::error!(client_id = %context.id, job_id = %record.id, %error, "runner invocation failed");
                record.errors.push(format!("runner invocation failed: {error}"));
                record.mark_completed(false, Utc::now());
            }
        },
        Err(error) => {
            tracing::error!(client_id = %context.id, job_id = %record.id, %error, "cannot plan job run");
            record.errors.push(error.to_string());
            record.mark_completed(false, Utc::now());
        }
    }

    if !persist(context, record).await {
        tracing::error!(
            client_id = %context.id,
            job_id = %record.id,
            "failed to persist job outcome"
        );
    }
}

/// Replace the stored record with the in-memory one (everything except the
/// immutable id).
async fn persist(context: &WorkerContext, record: &JobRecord) -> bool {
    let mut doc = match bson::to_document(record) {
        Ok(doc) => doc,
        Err(error) => {
            tracing::error!(client_id = %context.id, %error, "failed to encode job record");
            return false;
        }
    };
    doc.remove("_id");
    context
        .store
        .update_one(JOBS, doc! {"_id": &record.id}, doc! {"$set": doc}, false)
        .await
}
