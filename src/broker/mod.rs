//! # Broker Connection Module
//!
//! Owns the single MQTT connection of the process.
//!
//! This module handles:
//! - Connecting with a fresh client id per attempt and waiting for CONNACK
//! - Dispatching every inbound message to the registered [`MessageHandler`]
//!   on its own task
//! - One inline reconnect when the connection drops
//! - Matching SUBSCRIBE requests with the broker's SUBACK
//! - Orderly DISCONNECT: the request is flushed before dispatch stops
//! - Tracking [`ConnectionState`] for the supervisor and health reporter
//!
//! The transport is reached through the [`Connector`], [`BrokerTransport`]
//! and [`BrokerEvents`] traits; [`mqtt`] provides the `rumqttc` backend.
//!
//! ## Sessions
//!
//! Every CONNACK starts a new session (clean session). A subscription is
//! only counted for the session it was confirmed in, so a reconnect always
//! reads as "not subscribed" until the supervisor subscribes again.

pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

pub use mqtt::MqttConnector;

/// One PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Events surfaced by the transport's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// The broker accepted the connection
    ConnAck,
    /// An application message
    Message(InboundMessage),
    /// A SUBSCRIBE went out with this packet id
    SubscribeSent(u16),
    /// The broker answered a SUBSCRIBE; `granted` is false if any filter was refused
    SubAck { pkid: u16, granted: bool },
    /// Our DISCONNECT has been written to the network
    Disconnected,
    /// Anything else (pings, other acks); ignored by dispatch
    Other,
}

/// Request side of an open connection
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Queue a SUBSCRIBE for a topic filter at QoS 1
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Queue an orderly DISCONNECT
    async fn disconnect(&self) -> Result<()>;
}

/// Event side of an open connection.
///
/// Requests queued on the matching [`BrokerTransport`] only reach the
/// network while this stream is polled. After an error, the next call
/// re-establishes the connection with the same options.
#[async_trait]
pub trait BrokerEvents: Send {
    async fn next_event(&mut self) -> Result<BrokerEvent>;
}

/// Factory for transport pairs, one per connection attempt
pub trait Connector: Send + Sync {
    fn open(&self, client_id: &str) -> (Arc<dyn BrokerTransport>, Box<dyn BrokerEvents>);
}

/// Receiver of inbound messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Snapshot of the connection flags
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub subscribed: bool,
}

/// Shared, read-only view of the live connection flags.
///
/// Only this module flips the flags.
#[derive(Debug, Default, Clone)]
pub struct StateHandle {
    connected: Arc<AtomicBool>,
    /// Incremented on every CONNACK; 0 means never connected
    session: Arc<AtomicU64>,
    /// Session whose subscriptions were confirmed; 0 means none
    subscribed_session: Arc<AtomicU64>,
}

impl StateHandle {
    pub fn snapshot(&self) -> ConnectionState {
        let connected = self.connected.load(Ordering::SeqCst);
        let session = self.session.load(Ordering::SeqCst);
        ConnectionState {
            connected,
            subscribed: connected
                && session != 0
                && self.subscribed_session.load(Ordering::SeqCst) == session,
        }
    }

    fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    fn set_connected(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Mark `session` subscribed; a no-op once a newer session exists
    fn confirm_subscribed(&self, session: u64) -> bool {
        if session != 0 {
            self.subscribed_session.store(session, Ordering::SeqCst);
        }
        self.snapshot().subscribed
    }

    fn clear(&self) {
        self.subscribed_session.store(0, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fixed(state: ConnectionState) -> Self {
        let handle = Self::default();
        if state.connected {
            handle.set_connected();
            if state.subscribed {
                handle.confirm_subscribed(handle.session());
            }
        }
        handle
    }
}

/// Subscribe bookkeeping forwarded from dispatch to [`Connection::subscribe`]
#[derive(Debug)]
enum SubscribeAck {
    Sent(u16),
    Acked { pkid: u16, granted: bool },
    SessionLost,
}

/// Handle to an established connection.
///
/// Dropping it without [`Connection::disconnect`] stops dispatch without
/// telling the broker.
pub struct Connection {
    client_id: String,
    transport: Arc<dyn BrokerTransport>,
    state: StateHandle,
    acks: Mutex<mpsc::UnboundedReceiver<SubscribeAck>>,
    ack_timeout: Duration,
    closing: CancellationToken,
    stop: CancellationToken,
    finished: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("state", &self.state.snapshot())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Connection {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current session; pass it back to [`Connection::confirm_subscribed`]
    pub fn session(&self) -> u64 {
        self.state.session()
    }

    /// Subscribe to one topic filter at QoS 1 and wait for the SUBACK.
    ///
    /// Subscribes on one connection are serialized.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Subscribe` if the request cannot be queued, the
    /// broker refuses the filter, the connection drops first, or no SUBACK
    /// arrives within the connect timeout.
    pub async fn subscribe(&self, filter: &str) -> Result<()> {
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}

        self.transport.subscribe(filter).await?;

        match timeout(self.ack_timeout, await_suback(&mut acks)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(BridgeError::Subscribe(format!("{}: {}", filter, reason))),
            Err(_) => Err(BridgeError::Subscribe(format!(
                "{}: no SUBACK within {}ms",
                filter,
                self.ack_timeout.as_millis()
            ))),
        }
    }

    /// Record that every configured filter has been subscribed in `session`.
    ///
    /// Returns false when the connection was re-established in between; the
    /// subscriptions then belong to a dead session.
    pub fn confirm_subscribed(&self, session: u64) -> bool {
        self.state.confirm_subscribed(session)
    }

    /// Send an orderly DISCONNECT, wait until it is written, then stop dispatch.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the request cannot be queued (for
    /// example when dispatch already ended). Dispatch is stopped either way.
    pub async fn disconnect(&self) -> Result<()> {
        self.closing.cancel();
        let queued = self.transport.disconnect().await;

        if queued.is_ok() && timeout(self.ack_timeout, self.finished.cancelled()).await.is_err() {
            warn!(
                "DISCONNECT for {} not flushed within {}ms",
                self.client_id,
                self.ack_timeout.as_millis()
            );
        }

        self.stop.cancel();
        self.state.clear();
        queued?;

        info!("Disconnected from broker ({})", self.client_id);
        Ok(())
    }
}

async fn await_suback(acks: &mut mpsc::UnboundedReceiver<SubscribeAck>) -> std::result::Result<(), &'static str> {
    let mut pkid = None;
    while let Some(ack) = acks.recv().await {
        match ack {
            SubscribeAck::Sent(id) if pkid.is_none() => pkid = Some(id),
            SubscribeAck::Acked { pkid: id, granted } if pkid == Some(id) => {
                return if granted { Ok(()) } else { Err("refused by broker") };
            }
            SubscribeAck::SessionLost => return Err("connection lost before SUBACK"),
            other => debug!("Ignoring stale {:?}", other),
        }
    }
    Err("connection closed")
}

/// Creates connections and owns the shared connection state
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    client_id_prefix: String,
    connect_timeout: Duration,
    handler: Option<Arc<dyn MessageHandler>>,
    state: StateHandle,
}

impl ConnectionManager {
    /// Create a manager
    ///
    /// # Arguments
    ///
    /// * `connector` - Transport factory
    /// * `client_id_prefix` - Client ids are `<prefix>-<uuid v4>`
    /// * `connect_timeout` - Deadline for CONNACK, SUBACK and the DISCONNECT flush
    pub fn new(connector: Arc<dyn Connector>, client_id_prefix: &str, connect_timeout: Duration) -> Self {
        Self {
            connector,
            client_id_prefix: client_id_prefix.to_string(),
            connect_timeout,
            handler: None,
            state: StateHandle::default(),
        }
    }

    /// Register the inbound-message callback, replacing any previous one.
    ///
    /// Applies to connections opened afterwards.
    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.snapshot()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Open one connection and start dispatching its messages.
    ///
    /// Dispatch runs until [`Connection::disconnect`], until the connection
    /// handle is dropped, or until the single reconnect fails.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or `BridgeError::Timeout` when no
    /// CONNACK arrives in time. No retry happens here.
    pub async fn connect(&self) -> Result<Connection> {
        let client_id = format!("{}-{}", self.client_id_prefix, Uuid::new_v4());
        info!("Connecting to broker as {}", client_id);

        let (transport, mut events) = self.connector.open(&client_id);
        await_connack(events.as_mut(), self.connect_timeout).await?;

        self.state.clear();
        self.state.set_connected();
        info!("Connected to broker as {}", client_id);

        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();
        let stop = CancellationToken::new();
        let finished = CancellationToken::new();

        let dispatch = Dispatch {
            events,
            handler: self.handler.clone(),
            state: self.state.clone(),
            acks: acks_tx,
            reconnect_timeout: self.connect_timeout,
            closing: closing.clone(),
            stop: stop.clone(),
            finished: finished.clone(),
        };
        tokio::spawn(dispatch.run());

        Ok(Connection {
            client_id,
            transport,
            state: self.state.clone(),
            acks: Mutex::new(acks_rx),
            ack_timeout: self.connect_timeout,
            closing,
            stop,
            finished,
        })
    }
}

async fn await_connack(events: &mut dyn BrokerEvents, deadline: Duration) -> Result<()> {
    let wait = async {
        loop {
            match events.next_event().await? {
                BrokerEvent::ConnAck => return Ok(()),
                other => debug!("Ignoring {:?} while waiting for CONNACK", other),
            }
        }
    };

    match timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout(format!(
            "no CONNACK within {}ms",
            deadline.as_millis()
        ))),
    }
}

/// The task polling one connection's event stream
struct Dispatch {
    events: Box<dyn BrokerEvents>,
    handler: Option<Arc<dyn MessageHandler>>,
    state: StateHandle,
    acks: mpsc::UnboundedSender<SubscribeAck>,
    reconnect_timeout: Duration,
    /// Set once a DISCONNECT is queued; errors then end dispatch
    closing: CancellationToken,
    stop: CancellationToken,
    finished: CancellationToken,
}

impl Dispatch {
    async fn run(mut self) {
        let _finished = self.finished.clone().drop_guard();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.events.next_event() => event,
            };

            match event {
                Ok(BrokerEvent::Message(message)) => self.deliver(message),
                Ok(BrokerEvent::ConnAck) => self.state.set_connected(),
                Ok(BrokerEvent::SubscribeSent(pkid)) => {
                    let _ = self.acks.send(SubscribeAck::Sent(pkid));
                }
                Ok(BrokerEvent::SubAck { pkid, granted }) => {
                    let _ = self.acks.send(SubscribeAck::Acked { pkid, granted });
                }
                Ok(BrokerEvent::Disconnected) => {
                    debug!("DISCONNECT flushed");
                    break;
                }
                Ok(BrokerEvent::Other) => {}
                Err(e) if self.closing.is_cancelled() => {
                    debug!("Connection closed while disconnecting: {}", e);
                    break;
                }
                Err(e) => {
                    self.state.clear();
                    let _ = self.acks.send(SubscribeAck::SessionLost);
                    warn!("Broker connection lost: {}", e);

                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }

        debug!("Broker dispatch stopped");
    }

    fn deliver(&self, message: InboundMessage) {
        match &self.handler {
            Some(handler) => {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(message).await });
            }
            None => debug!("No handler registered, dropping message on {}", message.topic),
        }
    }

    async fn reconnect(&mut self) -> bool {
        let result = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return false,
            result = await_connack(self.events.as_mut(), self.reconnect_timeout) => result,
        };

        match result {
            Ok(()) => {
                self.state.set_connected();
                info!("Reconnected to broker");
                true
            }
            Err(e) => {
                error!("Reconnect to broker failed: {}", e);
                false
            }
        }
    }
}
