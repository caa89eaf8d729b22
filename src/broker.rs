//! Managed AMQP session for the job queue.
//!
//! One durable direct exchange, one durable queue, persistent messages.
//! The session itself runs on a dedicated background task (`session`); the
//! public `Broker` handle is a thin clonable wrapper that sends typed
//! commands over a channel, so it stays safe to call from any task while
//! the session is reconnecting, and degrades to `false` once the session
//! is gone instead of panicking.

pub mod session;

use crate::config::{BrokerCredentials, BrokerEndpoint, TlsMaterial};
use crate::error::{BrokerError, Result};
use session::{Command, Session};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

/// Exchange every job message is published to.
pub const EXCHANGE: &str = "dock-schedule";
/// Durable queue (and routing key) the workers consume.
pub const ROUTE: &str = "job-queue";

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// One message taken off the job queue. The worker must ack explicitly;
/// dropping a `Delivery` without acking leaves the message outstanding for
/// redelivery.
pub struct Delivery {
    pub body: Vec<u8>,
    acker: lapin::acker::Acker,
}

impl Delivery {
    pub(crate) fn new(body: Vec<u8>, acker: lapin::acker::Acker) -> Self {
        Self { body, acker }
    }

    /// Acknowledge the message. Returns false if the underlying channel is
    /// gone; the broker will redeliver in that case.
    pub async fn ack(&self) -> bool {
        match self
            .acker
            .ack(lapin::options::BasicAckOptions::default())
            .await
        {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(%error, "failed to ack message");
                false
            }
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Clonable handle to a broker session task.
#[derive(Clone)]
pub struct Broker {
    id: String,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Broker {
    /// Connect and declare the exchange, spawning the session task.
    /// Blocks until the session is usable or the connect budget is spent.
    pub async fn start(
        id: impl Into<String>,
        endpoint: BrokerEndpoint,
        creds: BrokerCredentials,
        tls: TlsMaterial,
    ) -> Result<Self> {
        let id = id.into();
        // TLS material is read once here; the session never touches disk.
        let session_tls = session::SessionTls {
            ca_pem: tls.ca_pem()?,
            identity_der: tls.pkcs12_der()?,
        };

        let (commands, command_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();

        let session = Session::new(id.clone(), endpoint, creds, session_tls, commands.clone());
        tokio::spawn(session.run(command_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::info!(client_id = %id, "broker session started");
                Ok(Self { id, commands })
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(BrokerError::Stopped.into()),
        }
    }

    /// Publish a message with the job id as message id, awaiting the
    /// publisher confirm. Returns true only when the broker acknowledged
    /// the frame.
    pub async fn send(&self, payload: Vec<u8>, message_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Send {
            payload,
            message_id: message_id.to_string(),
            reply: reply_tx,
        };
        if self.commands.send(command).await.is_err() {
            tracing::error!(client_id = %self.id, "send on a stopped broker session");
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Register a consumer on the job queue (prefetch 3, manual ack).
    /// Deliveries are forwarded into `sink` until the session stops.
    pub async fn consume(&self, sink: mpsc::Sender<Delivery>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Consume {
            sink,
            reply: reply_tx,
        };
        if self.commands.send(command).await.is_err() {
            tracing::error!(client_id = %self.id, "consume on a stopped broker session");
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Close channel then connection and join the session task.
    pub async fn stop(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Stop { reply: reply_tx })
            .await
            .is_err()
        {
            tracing::debug!(client_id = %self.id, "broker session already stopped");
            return true;
        }
        match tokio::time::timeout(STOP_JOIN_TIMEOUT, reply_rx).await {
            Ok(_) => {
                tracing::info!(client_id = %self.id, "broker session stopped");
                true
            }
            Err(_) => {
                tracing::error!(client_id = %self.id, "timed out joining broker session");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: &str) -> Self {
        // A handle whose session is already gone.
        let (commands, _) = mpsc::channel(1);
        Self {
            id: id.to_string(),
            commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_stop_returns_false_not_a_panic() {
        let broker = Broker::detached("test");
        assert!(!broker.send(b"job-1".to_vec(), "job-1").await);
    }

    #[tokio::test]
    async fn consume_after_stop_returns_false() {
        let broker = Broker::detached("test");
        let (sink, _rx) = mpsc::channel(1);
        assert!(!broker.consume(sink).await);
    }

    #[tokio::test]
    async fn stop_on_a_stopped_session_is_a_no_op() {
        let broker = Broker::detached("test");
        assert!(broker.stop().await);
    }
}
