/*!
Test Harness pour noeuds RoomWatch

Wires a full node (controller, router, connection manager) on top of the
in-memory broker:
- envoi de payloads scellés sur les topics configurés
- attente d'événements KernelEvent avec timeout
- lecture en clair des commandes publiées
*/

use crate::mock_transport::MockBroker;
use anyhow::{bail, Context, Result};
use roomwatch_kernel::broker::{BrokerEndpoint, BusHandle, ConnectionManager, ConnectionState};
use roomwatch_kernel::config::KernelConfig;
use roomwatch_kernel::controller::Controller;
use roomwatch_kernel::envelope::{Envelope, EnvelopeCodec, SymmetricKey};
use roomwatch_kernel::events::{EventBroadcaster, KernelEvent};
use roomwatch_kernel::health::HealthTracker;
use roomwatch_kernel::models::ControlConfig;
use roomwatch_kernel::router::{TopicMap, TopicRole, TopicRouter};
use roomwatch_kernel::window::{Clock, FixedClock};
use std::sync::Arc;
use std::time::Duration;
use time::macros::time;
use time::Time;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct HarnessBuilder {
    config: KernelConfig,
    clock: Time,
    retry_delay: Duration,
    broker: MockBroker,
}

impl HarnessBuilder {
    pub fn endpoints(mut self, hosts: &[&str]) -> Self {
        self.config.mqtt.brokers = hosts.iter().map(|h| BrokerEndpoint::new(*h, 1883)).collect();
        self
    }

    /// Connections to `host` fail from the very first attempt
    pub fn failing(self, host: &str) -> Self {
        self.broker.set_failing(host, true);
        self
    }

    /// `host` accepts the connection but refuses every subscription
    pub fn refusing(self, host: &str) -> Self {
        self.broker.refuse_subscriptions(host);
        self
    }

    pub fn threshold(mut self, t: f64) -> Self {
        self.config.defaults.temp_threshold = t;
        self
    }

    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config.defaults = config;
        self
    }

    pub fn clock_at(mut self, now: Time) -> Self {
        self.clock = now;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn cooling_control(mut self, enabled: bool) -> Self {
        self.config.roles.cooling_control = enabled;
        self
    }

    /// Sensor node: Temperature and Motion are produced locally, not subscribed.
    /// The producer loop itself is left to the test.
    pub fn producer_role(mut self) -> Self {
        self.config.producer.enabled = true;
        self
    }

    /// Spawns the inbound loop; call from inside a tokio runtime
    pub fn start(self) -> Result<TestHarness> {
        init_tracing();
        let cfg = self.config;
        cfg.validate().context("harness config")?;

        let key = SymmetricKey::generate().context("test key")?;
        let codec = Arc::new(EnvelopeCodec::encrypted(&key));
        let topics = cfg.topics.clone();
        let events = EventBroadcaster::new(cfg.events.capacity);
        let receiver = events.subscribe();
        let health = HealthTracker::new();
        let bus = BusHandle::new();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(self.clock));

        let controller = Controller::new(cfg.defaults.clone(), bus.clone(), events.clone(), codec.clone(), topics.clone())
            .with_clock(clock)
            .with_cooling_control(cfg.roles.cooling_control);
        let router = TopicRouter::new(controller.clone(), health.clone());
        let subscriptions = cfg.subscriptions();

        let manager = ConnectionManager::new(
            self.broker.connector(),
            cfg.mqtt.brokers.clone(),
            subscriptions.clone(),
            bus.clone(),
            events,
            health.clone(),
        )
        .with_retry_delay(self.retry_delay);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(move |msg| router.route(&msg), shutdown_rx));

        Ok(TestHarness {
            broker: self.broker,
            controller,
            health,
            codec,
            topics,
            subscriptions,
            bus,
            receiver,
            shutdown,
            task,
        })
    }
}

pub struct TestHarness {
    pub broker: MockBroker,
    pub controller: Controller,
    pub health: HealthTracker,
    pub codec: Arc<EnvelopeCodec>,
    pub topics: TopicMap,
    pub subscriptions: Vec<String>,
    bus: BusHandle,
    receiver: broadcast::Receiver<KernelEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestHarness {
    /// Two endpoints ("primary", "fallback"), threshold 28, clock at 23:00,
    /// 50ms retry delay
    pub fn builder() -> HarnessBuilder {
        let mut config = KernelConfig::default();
        config.mqtt.brokers = vec![BrokerEndpoint::new("primary", 1883), BrokerEndpoint::new("fallback", 1883)];
        config.defaults.temp_threshold = 28.0;
        HarnessBuilder {
            config,
            clock: time!(23:00),
            retry_delay: Duration::from_millis(50),
            broker: MockBroker::new(),
        }
    }

    pub async fn wait_connected(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        while !self.bus.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                bail!("never connected (attempts: {:?})", self.broker.connect_attempts());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    /// Seals `plaintext` and injects it on `role`'s topic
    pub fn send(&self, role: TopicRole, plaintext: &str) -> usize {
        let sealed = self.codec.seal(plaintext).into_bytes();
        self.broker.simulate_incoming(self.topics.topic(role), sealed)
    }

    pub fn send_raw(&self, role: TopicRole, bytes: &[u8]) -> usize {
        self.broker.simulate_incoming(self.topics.topic(role), bytes)
    }

    /// Next event of any kind
    pub async fn next_event(&mut self) -> Result<KernelEvent> {
        loop {
            match tokio::time::timeout(DEFAULT_WAIT, self.receiver.recv()).await {
                Ok(Ok(event)) => return Ok(event),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => tracing::warn!(n, "harness lagged"),
                Ok(Err(e)) => bail!("event channel closed: {e}"),
                Err(_) => bail!("no event within {DEFAULT_WAIT:?}"),
            }
        }
    }

    /// Skips events until one matches
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Result<KernelEvent>
    where
        F: FnMut(&KernelEvent) -> bool,
    {
        loop {
            let event = self.next_event().await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    /// The next `n` connection state transitions
    pub async fn connection_states(&mut self, n: usize) -> Result<Vec<ConnectionState>> {
        let mut states = Vec::with_capacity(n);
        while states.len() < n {
            if let KernelEvent::ConnectionStateChanged { state } =
                self.wait_for(|e| matches!(e, KernelEvent::ConnectionStateChanged { .. })).await?
            {
                states.push(state);
            }
        }
        Ok(states)
    }

    pub fn drain_events(&mut self) -> Vec<KernelEvent> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }

    /// Decrypted payloads published on `role`'s topic, oldest first
    pub fn published(&self, role: TopicRole) -> Result<Vec<String>> {
        self.broker
            .published_on(self.topics.topic(role))
            .into_iter()
            .map(|m| self.codec.open(&Envelope::from_bytes(m.payload)).map_err(Into::into))
            .collect()
    }

    pub async fn wait_for_published(&self, role: TopicRole, count: usize) -> Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            let sent = self.published(role)?;
            if sent.len() >= count {
                return Ok(sent);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("expected {count} messages on {role}, got {sent:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stops the inbound loop and waits for the session to close
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(DEFAULT_WAIT, self.task)
            .await
            .context("bus loop did not stop")?
            .context("bus loop panicked")?;
        Ok(())
    }
}
