/*!
Broker en mémoire pour tests sans Mosquitto

Implements the kernel's `Connector`/`Session`/`Publisher` traits over tokio
channels. Records every connect attempt, subscription and publish so scenario
tests can assert on them, and lets a test inject inbound messages, fail hosts
or cut live sessions.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use roomwatch_kernel::broker::{BrokerEndpoint, Connector, InboundMessage, Publisher, Session};
use roomwatch_kernel::error::BusError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    /// `host:port` of the session that published it
    pub endpoint: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

enum Signal {
    Deliver(InboundMessage),
    Cut,
}

struct SessionLink {
    id: u64,
    endpoint: String,
    subscriptions: Vec<String>,
    tx: mpsc::UnboundedSender<Signal>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: u64,
    failing_hosts: HashSet<String>,
    refusing_hosts: HashSet<String>,
    attempts: Vec<String>,
    published: Vec<MockMessage>,
    live: Vec<SessionLink>,
}

/// Shared view of the fake broker network, cheap to clone
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector { broker: self.clone() }
    }

    /// Connection attempts to `host` fail until cleared
    pub fn set_failing(&self, host: &str, failing: bool) {
        let mut inner = self.inner.lock();
        if failing {
            inner.failing_hosts.insert(host.to_string());
        } else {
            inner.failing_hosts.remove(host);
        }
    }

    /// `host` accepts connections but refuses every subscription
    pub fn refuse_subscriptions(&self, host: &str) {
        self.inner.lock().refusing_hosts.insert(host.to_string());
    }

    /// `host:port` of every connect attempt, in order
    pub fn connect_attempts(&self) -> Vec<String> {
        self.inner.lock().attempts.clone()
    }

    /// Endpoint and subscriptions of every open session
    pub fn live_sessions(&self) -> Vec<(String, Vec<String>)> {
        self.inner
            .lock()
            .live
            .iter()
            .map(|l| (l.endpoint.clone(), l.subscriptions.clone()))
            .collect()
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.inner.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<MockMessage> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Delivers to every live session subscribed to `topic`; returns how many got it
    pub fn simulate_incoming(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let msg = InboundMessage { topic: topic.to_string(), payload: payload.into() };
        let inner = self.inner.lock();
        let mut delivered = 0;
        for link in inner.live.iter().filter(|l| l.subscriptions.iter().any(|s| s == topic)) {
            if link.tx.send(Signal::Deliver(msg.clone())).is_ok() {
                delivered += 1;
            }
        }
        debug!(topic, delivered, "[mock] inbound");
        delivered
    }

    /// Cuts every live session as if the broker went away
    pub fn drop_sessions(&self) {
        let mut inner = self.inner.lock();
        for link in inner.live.drain(..) {
            let _ = link.tx.send(Signal::Cut);
        }
    }

    fn forget(&self, id: u64) {
        self.inner.lock().live.retain(|l| l.id != id);
    }

    fn is_live(&self, id: u64) -> bool {
        self.inner.lock().live.iter().any(|l| l.id == id)
    }
}

pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn make_session(&self, endpoint: &BrokerEndpoint) -> Result<MockSession, BusError> {
        let mut inner = self.broker.inner.lock();
        inner.attempts.push(endpoint.to_string());
        if inner.failing_hosts.contains(&endpoint.host) {
            return Err(BusError::Transport(format!("connection refused by {endpoint}")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.live.push(SessionLink { id, endpoint: endpoint.to_string(), subscriptions: Vec::new(), tx });
        Ok(MockSession {
            broker: self.broker.clone(),
            id,
            refuses: inner.refusing_hosts.contains(&endpoint.host),
            endpoint: endpoint.to_string(),
            rx,
        })
    }
}

pub struct MockSession {
    broker: MockBroker,
    id: u64,
    refuses: bool,
    endpoint: String,
    rx: mpsc::UnboundedReceiver<Signal>,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        if self.refuses {
            return Err(BusError::SubscribeRefused(topic.to_string()));
        }
        let mut inner = self.broker.inner.lock();
        let link = inner
            .live
            .iter_mut()
            .find(|l| l.id == self.id)
            .ok_or_else(|| BusError::Transport("session closed".into()))?;
        link.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<InboundMessage, BusError> {
        match self.rx.recv().await {
            Some(Signal::Deliver(msg)) => Ok(msg),
            Some(Signal::Cut) | None => {
                self.broker.forget(self.id);
                Err(BusError::Transport(format!("{} went away", self.endpoint)))
            }
        }
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MockPublisher { broker: self.broker.clone(), id: self.id, endpoint: self.endpoint.clone() })
    }

    async fn close(&mut self) {
        self.broker.forget(self.id);
    }
}

struct MockPublisher {
    broker: MockBroker,
    id: u64,
    endpoint: String,
}

impl Publisher for MockPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.broker.is_live(self.id) {
            return Err(BusError::NotConnected);
        }
        debug!(topic, bytes = payload.len(), "[mock] published");
        self.broker.inner.lock().published.push(MockMessage {
            endpoint: self.endpoint.clone(),
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_host_is_recorded() {
        let broker = MockBroker::new();
        broker.set_failing("primary", true);
        let connector = broker.connector();

        assert!(connector.make_session(&BrokerEndpoint::new("primary", 1883)).await.is_err());
        assert!(connector.make_session(&BrokerEndpoint::new("fallback", 1883)).await.is_ok());
        assert_eq!(broker.connect_attempts(), vec!["primary:1883", "fallback:1883"]);
    }

    #[tokio::test]
    async fn test_delivery_follows_subscriptions() {
        let broker = MockBroker::new();
        let mut session = broker.connector().make_session(&BrokerEndpoint::new("b", 1883)).await.unwrap();
        session.subscribe("a/temp").await.unwrap();

        assert_eq!(broker.simulate_incoming("a/temp", "21.0"), 1);
        assert_eq!(broker.simulate_incoming("a/other", "x"), 0);
        let msg = session.next_message().await.unwrap();
        assert_eq!(msg.payload, b"21.0");
    }

    #[tokio::test]
    async fn test_cut_session_stops_publisher() {
        let broker = MockBroker::new();
        let mut session = broker.connector().make_session(&BrokerEndpoint::new("b", 1883)).await.unwrap();
        let publisher = session.publisher();
        publisher.publish("t", b"1".to_vec()).unwrap();

        broker.drop_sessions();
        assert!(session.next_message().await.is_err());
        assert_eq!(publisher.publish("t", b"2".to_vec()), Err(BusError::NotConnected));
        assert_eq!(broker.published().len(), 1);
        assert!(broker.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_refusing_host() {
        let broker = MockBroker::new();
        broker.refuse_subscriptions("strict");
        let mut session = broker.connector().make_session(&BrokerEndpoint::new("strict", 1883)).await.unwrap();
        assert_eq!(session.subscribe("t").await, Err(BusError::SubscribeRefused("t".into())));
    }
}
