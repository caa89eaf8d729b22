//! Publisher pool: materializes and enqueues job records off the tick loop.
//!
//! Each member owns its own store client and broker session, keyed by a
//! short random identifier. The tick loop never blocks on store or broker
//! I/O; it hands work to the pool and moves on.

use crate::api::JobSubmission;
use crate::broker::Broker;
use crate::config::{BrokerCredentials, Config, StoreCredentials};
use crate::error::Result;
use crate::jobs::{CronSpec, JobRecord};
use crate::store::{JOBS, Store};

use bson::doc;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Work accepted by the pool.
#[derive(Debug)]
pub enum PublishRequest {
    /// A cron spec fired: materialize a fresh record and publish it.
    Cron(CronSpec),
    /// An ad-hoc submission from the control API.
    Adhoc(JobSubmission),
    /// Redelivery of a stuck pending record. The record carries the bumped
    /// resend bookkeeping; persist it, then publish the id again.
    Resend(JobRecord),
}

/// A fixed-size pool of publisher members draining a shared work queue.
pub struct PublisherPool {
    tx: mpsc::Sender<PublishRequest>,
    brokers: Vec<Broker>,
    members: Vec<tokio::task::JoinHandle<()>>,
}

impl PublisherPool {
    /// Start `size` members, each with its own store and broker session.
    /// Fails when any member cannot establish its broker session within
    /// the connect budget.
    pub async fn start(
        size: usize,
        config: &Config,
        broker_creds: &BrokerCredentials,
        store_creds: &StoreCredentials,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<PublishRequest>(64);
        let rx = Arc::new(Mutex::new(rx));

        let mut brokers = Vec::with_capacity(size);
        let mut members = Vec::with_capacity(size);
        for _ in 0..size {
            let member_id = crate::short_id();
            tracing::info!(client_id = %member_id, "initializing publisher");

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

            brokers.push(broker.clone());
            members.push(tokio::spawn(member_loop(member_id, store, broker, rx.clone())));
        }

        Ok(Self {
            tx,
            brokers,
            members,
        })
    }

    /// Hand work to the pool. Returns false when the pool is stopped.
    pub async fn submit(&self, request: PublishRequest) -> bool {
        if self.tx.send(request).await.is_err() {
            tracing::error!("publish request dropped: publisher pool is stopped");
            return false;
        }
        true
    }

    /// Drain and stop every member, then close the broker sessions.
    pub async fn stop(self) {
        drop(self.tx);
        for member in self.members {
            let _ = member.await;
        }
        for broker in &self.brokers {
            broker.stop().await;
        }
    }
}

async fn member_loop(
    member_id: String,
    store: Store,
    broker: Broker,
    rx: Arc<Mutex<mpsc::Receiver<PublishRequest>>>,
) {
    loop {
        let request = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(request) = request else {
            tracing::debug!(client_id = %member_id, "publisher pool draining, member exiting");
            return;
        };
        handle_request(&member_id, &store, &broker, request).await;
    }
}

async fn handle_request(
    member_id: &str,
    store: &Store,
    broker: &Broker,
    request: PublishRequest,
) {
    match request {
        PublishRequest::Cron(spec) => {
            let record = JobRecord::from_spec(&spec, Utc::now());
            publish_new(member_id, store, broker, record).await;
        }
        PublishRequest::Adhoc(submission) => {
            let record = submission.into_record(Utc::now());
            publish_new(member_id, store, broker, record).await;
        }
        PublishRequest::Resend(record) => {
            let update = doc! {"$set": {
                "resendAttempt": record.resend_attempt,
                "resent": bson::DateTime::from_chrono(record.resent),
            }};
            if !store
                .update_one(JOBS, doc! {"_id": &record.id}, update, false)
                .await
            {
                tracing::error!(
                    client_id = %member_id,
                    job_id = %record.id,
                    "failed to persist resend bookkeeping"
                );
                return;
            }
            if !broker
                .send(record.id.clone().into_bytes(), &record.id)
                .await
            {
                tracing::error!(
                    client_id = %member_id,
                    job_id = %record.id,
                    attempt = record.resend_attempt,
                    "failed to resend job"
                );
            }
        }
    }
}

/// Insert the pending record, then publish its bare id. A failed publisher
/// confirm is not fatal here: the record stays pending and the redelivery
/// scan re-publishes it.
async fn publish_new(member_id: &str, store: &Store, broker: &Broker, record: JobRecord) {
    if !store.insert_one(JOBS, &record).await {
        tracing::error!(
            client_id = %member_id,
            job = %record.name,
            "failed to insert job record, not publishing"
        );
        return;
    }
    if !broker
        .send(record.id.clone().into_bytes(), &record.id)
        .await
    {
        tracing::error!(
            client_id = %member_id,
            job = %record.name,
            job_id = %record.id,
            "publish failed, record left pending for the redelivery scan"
        );
    }
}
