//! Document store client (MongoDB).
//!
//! Thin collection-oriented wrapper shared by the scheduler and workers.
//! The connection is lazy: the first operation drives a bounded retry loop,
//! and every operation degrades to a typed "not available" result (`None`,
//! empty vec, `0`, `false`) instead of propagating transport errors. Callers
//! are written to tolerate those results; the redelivery scan and the broker
//! redeliveries cover anything that slips through a store outage.

use crate::config::{StoreCredentials, StoreEndpoint, TlsMaterial};
use crate::jobs::JobState;

use bson::{Document, doc};
use mongodb::options::{
    ClientOptions, CountOptions, FindOneOptions, FindOptions, IndexOptions, Tls, TlsOptions,
    UpdateOptions,
};
use mongodb::{Client, IndexModel};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;

/// Collection holding cron specs.
pub const CRONS: &str = "crons";
/// Collection holding job records.
pub const JOBS: &str = "jobs";

const CONNECT_ATTEMPTS: u32 = 36;
const CONNECT_SPACING: Duration = Duration::from_secs(2);
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(2);
const COUNT_DEADLINE: Duration = Duration::from_secs(2);

/// A lazily-connected store client, keyed by a short identifier so log lines
/// from different pool members are tellable apart.
pub struct Store {
    id: String,
    endpoint: StoreEndpoint,
    creds: StoreCredentials,
    tls: TlsMaterial,
    client: Mutex<Option<Client>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(
        id: impl Into<String>,
        endpoint: StoreEndpoint,
        creds: StoreCredentials,
        tls: TlsMaterial,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint,
            creds,
            tls,
            client: Mutex::new(None),
        }
    }

    fn uri(&self) -> String {
        format!(
            "mongodb://{}:{}@{}:{}/",
            urlencoding::encode(&self.creds.user),
            urlencoding::encode(&self.creds.passwd),
            self.endpoint.host,
            self.endpoint.port
        )
    }

    /// Connect if needed. Returns `None` once the retry budget is exhausted;
    /// the next call starts a fresh budget.
    async fn client(&self) -> Option<Client> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Some(client.clone());
        }

        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.try_connect().await {
                Ok(client) => {
                    tracing::info!(client_id = %self.id, "store client created");
                    *guard = Some(client.clone());
                    return Some(client);
                }
                Err(error) => {
                    tracing::error!(
                        client_id = %self.id,
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        %error,
                        "failed to connect to store"
                    );
                }
            }
            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(CONNECT_SPACING).await;
            }
        }
        None
    }

    async fn try_connect(&self) -> Result<Client, crate::error::StoreError> {
        let mut options = ClientOptions::parse(self.uri()).await?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.tls = Some(Tls::Enabled(
            TlsOptions::builder()
                .ca_file_path(Some(self.tls.ca_file.clone()))
                .cert_key_file_path(Some(self.tls.combined_pem.clone()))
                .build(),
        ));

        let client = Client::with_options(options)?;
        client
            .database("admin")
            .run_command(doc! {"ping": 1})
            .await?;
        Ok(client)
    }

    async fn collection(&self, name: &str) -> Option<mongodb::Collection<Document>> {
        let client = self.client().await?;
        Some(client.database(&self.creds.db).collection(name))
    }

    /// Insert a single document. Returns false when the store is down or the
    /// write fails.
    pub async fn insert_one<T: Serialize>(&self, collection: &str, document: &T) -> bool {
        let Some(target) = self.collection(collection).await else {
            return false;
        };
        let doc = match bson::to_document(document) {
            Ok(doc) => doc,
            Err(error) => {
                tracing::error!(client_id = %self.id, %error, "failed to encode document");
                return false;
            }
        };
        match target.insert_one(doc).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to insert document");
                false
            }
        }
    }

    /// Insert a batch of documents.
    pub async fn insert_many<T: Serialize>(&self, collection: &str, documents: &[T]) -> bool {
        let Some(target) = self.collection(collection).await else {
            return false;
        };
        let mut docs = Vec::with_capacity(documents.len());
        for document in documents {
            match bson::to_document(document) {
                Ok(doc) => docs.push(doc),
                Err(error) => {
                    tracing::error!(client_id = %self.id, %error, "failed to encode document");
                    return false;
                }
            }
        }
        match target.insert_many(docs).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to insert documents");
                false
            }
        }
    }

    /// Find one document and decode it.
    pub async fn find_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Document,
    ) -> Option<T> {
        let doc = self.find_one_raw(collection, filter, None).await?;
        self.decode(doc)
    }

    /// Find one document with a projection, returned undecoded since
    /// projected documents are partial.
    pub async fn find_one_projected(
        &self,
        collection: &str,
        filter: Document,
        projection: Document,
    ) -> Option<Document> {
        self.find_one_raw(collection, filter, Some(projection)).await
    }

    async fn find_one_raw(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Option<Document> {
        let target = self.collection(collection).await?;
        let options = FindOneOptions::builder().projection(projection).build();
        match target.find_one(filter).with_options(options).await {
            Ok(doc) => doc,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to find document");
                None
            }
        }
    }

    /// Find every matching document. Undecodable documents are logged and
    /// skipped rather than failing the batch.
    pub async fn find_all<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Document,
    ) -> Vec<T> {
        self.find_cursor(collection, filter, None, None).await
    }

    /// Find with sort and limit, serving cursor-style history queries.
    pub async fn find_sorted<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Document,
        sort: Document,
        limit: i64,
    ) -> Vec<T> {
        self.find_cursor(collection, filter, Some(sort), Some(limit)).await
    }

    async fn find_cursor<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> Vec<T> {
        use futures::TryStreamExt as _;

        let Some(target) = self.collection(collection).await else {
            return Vec::new();
        };
        let options = FindOptions::builder().sort(sort).limit(limit).build();
        let mut cursor = match target.find(filter).with_options(options).await {
            Ok(cursor) => cursor,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to query collection");
                return Vec::new();
            }
        };

        let mut decoded = Vec::new();
        loop {
            match cursor.try_next().await {
                Ok(Some(doc)) => {
                    if let Some(value) = self.decode(doc) {
                        decoded.push(value);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(client_id = %self.id, collection, %error, "cursor read failed");
                    break;
                }
            }
        }
        decoded
    }

    /// Apply an update to the first matching document.
    pub async fn update_one(
        &self,
        collection: &str,
        query: Document,
        update: Document,
        upsert: bool,
    ) -> bool {
        let Some(target) = self.collection(collection).await else {
            return false;
        };
        let options = UpdateOptions::builder().upsert(Some(upsert)).build();
        match target.update_one(query, update).with_options(options).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to update document");
                false
            }
        }
    }

    /// Apply an update to every matching document.
    pub async fn update_many(
        &self,
        collection: &str,
        query: Document,
        update: Document,
        upsert: bool,
    ) -> bool {
        let Some(target) = self.collection(collection).await else {
            return false;
        };
        let options = UpdateOptions::builder().upsert(Some(upsert)).build();
        match target.update_many(query, update).with_options(options).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to update documents");
                false
            }
        }
    }

    /// Delete the first matching document.
    pub async fn delete_one(&self, collection: &str, query: Document) -> bool {
        let Some(target) = self.collection(collection).await else {
            return false;
        };
        match target.delete_one(query).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to delete document");
                false
            }
        }
    }

    /// Delete every matching document.
    pub async fn delete_many(&self, collection: &str, query: Document) -> bool {
        let Some(target) = self.collection(collection).await else {
            return false;
        };
        match target.delete_many(query).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to delete documents");
                false
            }
        }
    }

    /// Count matching documents under the scrape deadline. Returns 0 when
    /// the store is unavailable.
    pub async fn count(&self, collection: &str, filter: Document) -> u64 {
        let Some(target) = self.collection(collection).await else {
            return 0;
        };
        let options = CountOptions::builder()
            .max_time(Some(COUNT_DEADLINE))
            .build();
        match target.count_documents(filter).with_options(options).await {
            Ok(count) => count,
            Err(error) => {
                tracing::error!(client_id = %self.id, collection, %error, "failed to count documents");
                0
            }
        }
    }

    /// Create the TTL index that reaps expired job records. Idempotent.
    pub async fn ensure_indexes(&self) -> bool {
        let Some(target) = self.collection(JOBS).await else {
            return false;
        };
        let model = IndexModel::builder()
            .keys(doc! {"expiryTime": 1})
            .options(
                IndexOptions::builder()
                    .expire_after(Some(Duration::ZERO))
                    .build(),
            )
            .build();
        match target.create_index(model).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(client_id = %self.id, %error, "failed to create job TTL index");
                false
            }
        }
    }

    /// Hot-path projection for result polling: `{result, errors}`.
    pub async fn job_result(&self, job_id: &str) -> Option<Document> {
        self.find_one_projected(
            JOBS,
            doc! {"_id": job_id},
            doc! {"result": 1, "errors": 1},
        )
        .await
    }

    /// Hot-path projection for the worker duplicate check: `{state}`.
    pub async fn job_state(&self, job_id: &str) -> Option<JobState> {
        let doc = self
            .find_one_projected(JOBS, doc! {"_id": job_id}, doc! {"state": 1})
            .await?;
        let state = doc.get_str("state").ok()?;
        match state {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            _ => None,
        }
    }

    fn decode<T: DeserializeOwned>(&self, doc: Document) -> Option<T> {
        match bson::from_document(doc) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(client_id = %self.id, %error, "skipping undecodable document");
                None
            }
        }
    }
}
