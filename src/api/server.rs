//! HTTPS server for the control API: router, mutual TLS, route handlers.
//!
//! The server terminates TLS itself and requires a client certificate
//! signed by the cluster CA on every connection. Request handlers are thin:
//! they validate shape and forward a typed message; all scheduling decisions
//! stay in the scheduler loop.

use super::{ControlMessage, JobSubmission, SchedulerMetrics};
use crate::config::TlsMaterial;
use crate::store::Store;

use anyhow::Context as _;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state for the control API handlers.
pub struct ApiContext {
    /// Typed channel into the scheduler loop.
    pub control_tx: mpsc::Sender<ControlMessage>,
    /// Store client dedicated to the API (metrics counts).
    pub store: Store,
    pub metrics: SchedulerMetrics,
}

/// Start the control API server with mutual TLS on the given address.
///
/// Returns the `JoinHandle` so the scheduler can hold it for lifetime
/// management. The server shuts down when `shutdown_rx` signals true.
pub async fn start_control_api(
    bind: SocketAddr,
    tls: &TlsMaterial,
    context: Arc<ApiContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let tls_config = tls_server_config(tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let app = Router::new()
        .route("/is-running", get(is_running_handler))
        .route("/metrics", get(metrics_handler))
        .route("/run-job", post(run_job_handler))
        .route("/job-update", post(job_update_handler))
        .with_state(context);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind control API to {bind}"))?;
    tracing::info!(%bind, "control API listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(%error, "control API accept failed");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        serve_connection(acceptor, stream, peer, app).await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("control API shutting down");
                        return;
                    }
                }
            }
        }
    });

    Ok(handle)
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    app: Router,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(error) => {
            // Unauthenticated clients fail here: no CA-signed cert, no session.
            tracing::warn!(%peer, %error, "TLS handshake failed");
            return;
        }
    };

    let service = TowerToHyperService::new(app);
    if let Err(error) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        tracing::debug!(%peer, %error, "control API connection ended with error");
    }
}

/// Build the rustls server config: host identity plus required
/// client-certificate verification against the cluster CA.
fn tls_server_config(tls: &TlsMaterial) -> anyhow::Result<rustls::ServerConfig> {
    let ca_file = std::fs::File::open(&tls.ca_file)
        .with_context(|| format!("failed to open CA file {}", tls.ca_file.display()))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(ca_file)) {
        roots
            .add(cert.context("invalid certificate in CA file")?)
            .context("failed to add CA certificate to trust root")?;
    }

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("failed to build client certificate verifier")?;

    let cert_file = std::fs::File::open(&tls.cert_file)
        .with_context(|| format!("failed to open host certificate {}", tls.cert_file.display()))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid host certificate")?;

    let key_file = std::fs::File::open(&tls.key_file)
        .with_context(|| format!("failed to open host key {}", tls.key_file.display()))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .context("invalid host key")?
        .context("no private key found in host key file")?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("failed to assemble TLS server config")
}

async fn is_running_handler() -> Response {
    (StatusCode::OK, "Control API is running").into_response()
}

async fn metrics_handler(State(context): State<Arc<ApiContext>>) -> Response {
    match context.metrics.scrape(&context.store).await {
        Some(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to get metrics").into_response(),
    }
}

async fn run_job_handler(State(context): State<Arc<ApiContext>>, body: Bytes) -> Response {
    let submission: JobSubmission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(error) => {
            tracing::error!(%error, "invalid run-job request body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed").into_response();
        }
    };

    if context
        .control_tx
        .send(ControlMessage::RunJob(submission))
        .await
        .is_err()
    {
        tracing::error!("scheduler loop is gone, dropping run-job request");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed").into_response();
    }
    (StatusCode::OK, "success").into_response()
}

async fn job_update_handler(State(context): State<Arc<ApiContext>>, _body: Bytes) -> Response {
    // Payload is ignored; the message is purely an invalidation signal.
    if context
        .control_tx
        .send(ControlMessage::JobUpdate)
        .await
        .is_err()
    {
        tracing::error!("scheduler loop is gone, dropping job-update request");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed").into_response();
    }
    (StatusCode::OK, "success").into_response()
}
