//! Broker session task: connection lifecycle, confirms, and reconnects.
//!
//! The session owns the lapin connection and channel and serializes every
//! operation through one command loop. Callers never touch AMQP state
//! directly; they park on their reply while the session reconnects. The
//! reconnect budget is 36 attempts spaced 5 s apart (first attempt
//! immediate), after which sends fail until the next command retries the
//! budget from scratch.

use crate::broker::{Delivery, EXCHANGE, ROUTE};
use crate::config::{BrokerCredentials, BrokerEndpoint};
use crate::error::BrokerError;

use futures::StreamExt as _;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

const MAX_CONNECT_ATTEMPTS: u32 = 36;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_SECS: u16 = 15;
const BLOCKED_WAIT_SECS: u32 = 180;
const RETURN_REPUBLISH_DELAY: Duration = Duration::from_secs(1);
const PREFETCH: u16 = 3;

/// Commands accepted by the session loop. `ConsumerEnded` is internal:
/// consumer forwarder tasks use it to report a dead stream.
pub(crate) enum Command {
    Send {
        payload: Vec<u8>,
        message_id: String,
        reply: oneshot::Sender<bool>,
    },
    Consume {
        sink: mpsc::Sender<Delivery>,
        reply: oneshot::Sender<bool>,
    },
    ConsumerEnded,
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// TLS material pre-loaded by the handle so the session never touches the
/// filesystem.
pub(crate) struct SessionTls {
    pub ca_pem: String,
    pub identity_der: Vec<u8>,
}

pub(crate) struct Session {
    id: String,
    endpoint: BrokerEndpoint,
    creds: BrokerCredentials,
    tls: SessionTls,
    /// Clone of the command sender, handed to consumer forwarder tasks.
    internal: mpsc::Sender<Command>,
    connection: Option<Connection>,
    channel: Option<Channel>,
    queue_declared: bool,
    /// Desired consumers, re-established after every reconnect.
    sinks: Vec<mpsc::Sender<Delivery>>,
    consumer_seq: u32,
}

impl Session {
    pub(crate) fn new(
        id: String,
        endpoint: BrokerEndpoint,
        creds: BrokerCredentials,
        tls: SessionTls,
        internal: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            id,
            endpoint,
            creds,
            tls,
            internal,
            connection: None,
            channel: None,
            queue_declared: false,
            sinks: Vec::new(),
            consumer_seq: 0,
        }
    }

    /// Session loop. Signals `ready` after the initial connect attempt, then
    /// serves commands until `Stop` or until every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        ready: oneshot::Sender<Result<(), BrokerError>>,
    ) {
        let startup = self.ensure_session().await;
        let failed = startup.is_err();
        let _ = ready.send(startup);
        if failed {
            return;
        }

        while let Some(command) = commands.recv().await {
            match command {
                Command::Send {
                    payload,
                    message_id,
                    reply,
                } => {
                    let sent = self.handle_send(payload, &message_id).await;
                    let _ = reply.send(sent);
                }
                Command::Consume { sink, reply } => {
                    let consuming = self.handle_consume(sink).await;
                    let _ = reply.send(consuming);
                }
                Command::ConsumerEnded => {
                    self.handle_consumer_ended().await;
                }
                Command::Stop { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        self.shutdown().await;
    }

    /// True when both connection and channel are live.
    fn session_open(&self) -> bool {
        match (&self.connection, &self.channel) {
            (Some(connection), Some(channel)) => {
                connection.status().connected() && channel.status().connected()
            }
            _ => false,
        }
    }

    /// Connect (or reconnect) within the attempt budget.
    async fn ensure_session(&mut self) -> Result<(), BrokerError> {
        if self.session_open() {
            return Ok(());
        }
        self.reset();

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(RECONNECT_DELAY).await;
                tracing::info!(
                    client_id = %self.id,
                    attempt,
                    max_attempts = MAX_CONNECT_ATTEMPTS,
                    "reconnecting to broker"
                );
            }
            match self.open_session().await {
                Ok(()) => {
                    tracing::info!(client_id = %self.id, "connected to broker");
                    return Ok(());
                }
                Err(error) => {
                    tracing::error!(client_id = %self.id, attempt, %error, "failed to connect to broker");
                    self.reset();
                }
            }
        }
        Err(BrokerError::ConnectBudgetExhausted {
            attempts: MAX_CONNECT_ATTEMPTS,
        })
    }

    async fn open_session(&mut self) -> Result<(), BrokerError> {
        let uri = format!(
            "amqps://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.creds.user),
            urlencoding::encode(&self.creds.passwd),
            self.endpoint.host,
            self.endpoint.port,
            urlencoding::encode(&self.creds.vhost),
            HEARTBEAT_SECS,
        );
        let tls = OwnedTLSConfig {
            identity: Some(OwnedIdentity {
                der: self.tls.identity_der.clone(),
                password: String::new(),
            }),
            cert_chain: Some(self.tls.ca_pem.clone()),
        };

        let connection =
            Connection::connect_with_config(&uri, ConnectionProperties::default(), tls).await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.connection = Some(connection);
        self.channel = Some(channel);
        self.queue_declared = false;

        if !self.sinks.is_empty() {
            self.establish_consumers().await?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.connection = None;
        self.channel = None;
        self.queue_declared = false;
    }

    async fn declare_queue(&mut self) -> Result<(), BrokerError> {
        if self.queue_declared {
            return Ok(());
        }
        let channel = self.channel.clone().ok_or(BrokerError::Stopped)?;
        channel
            .queue_declare(
                ROUTE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.queue_declared = true;
        tracing::info!(client_id = %self.id, "declared queue");
        Ok(())
    }

    async fn handle_send(&mut self, payload: Vec<u8>, message_id: &str) -> bool {
        if !self.wait_for_unblock().await {
            return false;
        }
        if let Err(error) = self.ensure_session().await {
            tracing::error!(client_id = %self.id, %error, "failed to send message to queue");
            return false;
        }
        if let Err(error) = self.declare_queue().await {
            tracing::error!(client_id = %self.id, %error, "failed to declare queue");
            return false;
        }

        match self.publish(&payload, message_id).await {
            Ok(true) => {
                tracing::info!(
                    client_id = %self.id,
                    job_id = %short(message_id),
                    "sent job to queue"
                );
                true
            }
            Ok(false) => {
                // A nack means channel state is suspect. Reconnect so the
                // next send starts from a clean channel; this message is the
                // redelivery scan's problem now.
                tracing::error!(client_id = %self.id, "message not acknowledged");
                if let Err(error) = self.force_reconnect().await {
                    tracing::error!(client_id = %self.id, %error, "reconnect after nack failed");
                }
                false
            }
            Err(error) => {
                tracing::error!(client_id = %self.id, %error, "failed to send message to queue");
                false
            }
        }
    }

    async fn publish(&mut self, payload: &[u8], message_id: &str) -> Result<bool, BrokerError> {
        let channel = self.channel.clone().ok_or(BrokerError::Stopped)?;
        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };
        let properties = BasicProperties::default()
            .with_content_type("application/octet-stream".to_string().into())
            .with_delivery_mode(2)
            .with_message_id(message_id.to_string().into());

        let mut confirmation = channel
            .basic_publish(EXCHANGE, ROUTE, options, payload, properties.clone())
            .await?
            .await?;
        if confirmation.is_nack() {
            return Ok(false);
        }
        if confirmation.take_message().is_some() {
            // Unroutable: the broker handed the message back. Give the
            // topology a moment to settle and re-publish the same body.
            tracing::error!(
                client_id = %self.id,
                job_id = %short(message_id),
                "message returned to sender, resending to queue"
            );
            tokio::time::sleep(RETURN_REPUBLISH_DELAY).await;
            let retry = channel
                .basic_publish(EXCHANGE, ROUTE, options, payload, properties)
                .await?
                .await?;
            return Ok(!retry.is_nack());
        }
        Ok(true)
    }

    /// Park while the broker has the connection blocked on a resource
    /// alarm, up to the block timeout.
    async fn wait_for_unblock(&self) -> bool {
        let Some(connection) = &self.connection else {
            return true;
        };
        if !connection.status().blocked() {
            return true;
        }
        tracing::info!(client_id = %self.id, "connection blocked, waiting for unblock from server");
        for _ in 0..BLOCKED_WAIT_SECS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !connection.status().blocked() {
                tracing::info!(client_id = %self.id, "connection unblocked, resuming operations");
                return true;
            }
        }
        tracing::error!(client_id = %self.id, "timeout waiting for connection unblock");
        false
    }

    async fn handle_consume(&mut self, sink: mpsc::Sender<Delivery>) -> bool {
        // Blocking is connection-wide: consumers park on a resource alarm
        // just like publishers.
        if !self.wait_for_unblock().await {
            return false;
        }
        if let Err(error) = self.ensure_session().await {
            tracing::error!(client_id = %self.id, %error, "failed to start consumer");
            return false;
        }
        self.sinks.push(sink.clone());
        match self.bind_and_consume(sink).await {
            Ok(()) => {
                tracing::info!(client_id = %self.id, "started consuming messages from queue");
                true
            }
            Err(error) => {
                tracing::error!(client_id = %self.id, %error, "failed to bind to queue");
                self.sinks.pop();
                false
            }
        }
    }

    async fn establish_consumers(&mut self) -> Result<(), BrokerError> {
        // Rebinding issues qos and queue_bind frames; wait out any resource
        // alarm before touching the channel.
        if !self.wait_for_unblock().await {
            return Err(BrokerError::BlockedTimeout);
        }
        for sink in self.sinks.clone() {
            self.bind_and_consume(sink).await?;
        }
        Ok(())
    }

    async fn bind_and_consume(&mut self, sink: mpsc::Sender<Delivery>) -> Result<(), BrokerError> {
        let channel = self.channel.clone().ok_or(BrokerError::Stopped)?;
        channel.basic_qos(PREFETCH, BasicQosOptions::default()).await?;
        self.declare_queue().await?;
        channel
            .queue_bind(
                ROUTE,
                EXCHANGE,
                ROUTE,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.spawn_consumer(channel, sink).await
    }

    async fn spawn_consumer(
        &mut self,
        channel: Channel,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<(), BrokerError> {
        self.consumer_seq += 1;
        let tag = format!("{}-{}", self.id, self.consumer_seq);
        let mut consumer = channel
            .basic_consume(ROUTE, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        let internal = self.internal.clone();
        let client_id = self.id.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let lapin::message::Delivery { data, acker, .. } = delivery;
                        if sink.send(Delivery::new(data, acker)).await.is_err() {
                            tracing::debug!(client_id = %client_id, "consumer sink closed, ending consumer");
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::error!(client_id = %client_id, %error, "consumer stream error");
                        break;
                    }
                }
            }
            // Stream ended underneath us: the channel or connection died.
            let _ = internal.send(Command::ConsumerEnded).await;
        });
        Ok(())
    }

    async fn handle_consumer_ended(&mut self) {
        self.sinks.retain(|sink| !sink.is_closed());
        if self.sinks.is_empty() {
            return;
        }
        // A rebuild triggered by an earlier ConsumerEnded already respawned
        // every consumer; stale notifications land here and are dropped.
        if self.session_open() {
            return;
        }
        tracing::error!(client_id = %self.id, "consumer stream ended, rebuilding session");
        if let Err(error) = self.ensure_session().await {
            tracing::error!(client_id = %self.id, %error, "failed to rebuild consumer session");
        }
    }

    async fn force_reconnect(&mut self) -> Result<(), BrokerError> {
        self.reset();
        self.ensure_session().await
    }

    async fn shutdown(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(error) = channel.close(200, "client shutdown").await {
                tracing::debug!(client_id = %self.id, %error, "channel close failed");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(error) = connection.close(200, "client shutdown").await {
                tracing::debug!(client_id = %self.id, %error, "connection close failed");
            }
        }
        tracing::info!(client_id = %self.id, "broker session closed");
    }
}

/// First 8 characters of a job id, enough to correlate log lines.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::short;

    #[test]
    fn short_id_truncates_without_panicking() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
        assert_eq!(short(""), "");
    }
}
