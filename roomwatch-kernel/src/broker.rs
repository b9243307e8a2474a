/**
 * BROKER - Gestionnaire de connexion au bus pub/sub
 *
 * RÔLE :
 * Owns the broker session for the whole process. Tries the endpoints in
 * preference order (primary, then fallbacks), subscribes every configured topic,
 * feeds inbound messages to the router, and reconnects from the top of the list
 * whenever the session drops.
 *
 * FONCTIONNEMENT :
 * - Connector::make_session(endpoint) = factory, one fresh session per attempt
 * - Session = subscribe + restartable stream of (topic, bytes)
 * - BusHandle = publish side, shared by controller and producer; fails fast when
 *   no session is up, never queues
 * - ConnectionState changes are emitted as events (only on real transitions)
 *
 * The concrete MQTT transport lives in `mqtt.rs`; tests plug in the devkit mock.
 */

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::events::{EventBroadcaster, KernelEvent};
use crate::health::HealthTracker;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_port() -> u16 {
    1883
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, credentials: None }
    }

    /// `host` or `host:port`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Some(Self::new(host, port.parse().ok()?)),
            Some(_) => None,
            None if !raw.is_empty() => Some(Self::new(raw, default_port())),
            None => None,
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// credentials stay out of logs
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials.as_ref().map(|c| &c.username))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Outbound half of a live session
pub trait Publisher: Send + Sync {
    /// Hand the payload to the transport, at most once, without waiting for the broker
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
pub trait Session: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BusError>;

    /// Next inbound message. An error means the session is gone.
    async fn next_message(&mut self) -> Result<InboundMessage, BusError>;

    fn publisher(&self) -> Arc<dyn Publisher>;

    async fn close(&mut self);
}

/// Session factory, invoked once per endpoint attempt
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session + 'static;

    async fn make_session(&self, endpoint: &BrokerEndpoint) -> Result<Self::Session, BusError>;
}

/// Publish side of the bus, cheap to clone
#[derive(Clone, Default)]
pub struct BusHandle {
    active: Arc<RwLock<Option<Arc<dyn Publisher>>>>,
}

impl BusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError> {
        let publisher = self.active.read().clone().ok_or(BusError::NotConnected)?;
        publisher.publish(topic, envelope.into_bytes())
    }

    pub fn is_connected(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn attach(&self, publisher: Arc<dyn Publisher>) {
        *self.active.write() = Some(publisher);
    }

    pub fn detach(&self) {
        *self.active.write() = None;
    }
}

impl fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHandle").field("connected", &self.is_connected()).finish()
    }
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    endpoints: Vec<BrokerEndpoint>,
    subscriptions: Vec<String>,
    bus: BusHandle,
    events: EventBroadcaster,
    health: HealthTracker,
    retry_delay: Duration,
    state: ConnectionState,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        endpoints: Vec<BrokerEndpoint>,
        subscriptions: Vec<String>,
        bus: BusHandle,
        events: EventBroadcaster,
        health: HealthTracker,
    ) -> Self {
        Self {
            connector,
            endpoints,
            subscriptions,
            bus,
            events,
            health,
            retry_delay: Duration::from_secs(5),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = ?self.state, to = ?next, "connection state");
        self.state = next;
        self.health.record_state(next);
        self.events.emit(KernelEvent::ConnectionStateChanged { state: next });
    }

    /// Tries every endpoint in order and returns the first session that
    /// completed the handshake and all subscriptions, with its endpoint index.
    pub async fn connect(&mut self) -> Result<(C::Session, usize), BusError> {
        self.set_state(ConnectionState::Connecting);
        let mut failures = Vec::with_capacity(self.endpoints.len());

        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            info!(%endpoint, "connecting to broker");
            match self.open(endpoint).await {
                Ok(session) => return Ok((session, idx)),
                Err(e) => {
                    warn!(%endpoint, error = %e, "broker attempt failed");
                    failures.push(format!("{endpoint} ({e})"));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no endpoint configured".into());
        }
        Err(BusError::BrokerUnavailable(failures.join("; ")))
    }

    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<C::Session, BusError> {
        let mut session = self.connector.make_session(endpoint).await?;
        for topic in &self.subscriptions {
            if let Err(e) = session.subscribe(topic).await {
                session.close().await;
                return Err(e);
            }
            debug!(%endpoint, topic, "subscribed");
        }
        Ok(session)
    }

    /// Runs until `shutdown` flips to true (or its sender goes away).
    /// `on_message` is called synchronously for every inbound message.
    pub async fn run<F>(mut self, mut on_message: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(InboundMessage) + Send,
    {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = tokio::select! {
                attempt = self.connect() => attempt,
                _ = shutdown.changed() => break,
            };

            let (mut session, idx) = match attempt {
                Ok(connected) => connected,
                Err(e) => {
                    error!(error = %e, retry_in = ?self.retry_delay, "no broker reachable");
                    self.set_state(ConnectionState::Error);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            let endpoint = self.endpoints[idx].to_string();
            self.bus.attach(session.publisher());
            self.health.mark_connected(endpoint.clone());
            self.set_state(ConnectionState::Connected);
            info!(%endpoint, topics = self.subscriptions.len(), "bus connected");

            let stopping = loop {
                tokio::select! {
                    msg = session.next_message() => match msg {
                        Ok(msg) => on_message(msg),
                        Err(e) => {
                            warn!(%endpoint, error = %e, "session lost, reconnecting");
                            break false;
                        }
                    },
                    _ = shutdown.changed() => break true,
                }
            };

            self.bus.detach();
            if stopping {
                session.close().await;
                break;
            }
            self.set_state(ConnectionState::Disconnected);
            self.health.increment_reconnects();
        }
        // also reached from Connecting / Error when shutdown interrupts a retry
        self.set_state(ConnectionState::Disconnected);
        info!("bus loop stopped");
    }
}
