//! rumqttc transport behind the broker traits.
//!
//! Every attempt builds a brand new `AsyncClient`/`EventLoop` pair; the event
//! loop's own auto-reconnect is never used, the connection manager decides
//! where to go next.

use crate::broker::{BrokerEndpoint, Connector, InboundMessage, Publisher, Session};
use crate::config::MqttConf;
use crate::error::BusError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub struct MqttConnector {
    client_id: String,
    keep_alive: Duration,
    handshake_timeout: Duration,
    capacity: usize,
}

impl MqttConnector {
    pub fn from_config(conf: &MqttConf) -> Self {
        Self {
            client_id: conf.client_id(),
            keep_alive: Duration::from_secs(conf.keep_alive_secs),
            handshake_timeout: Duration::from_secs(conf.connect_timeout_secs),
            capacity: 64,
        }
    }
}

fn transport(e: impl std::fmt::Display) -> BusError {
    BusError::Transport(e.to_string())
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn make_session(&self, endpoint: &BrokerEndpoint) -> Result<MqttSession, BusError> {
        let mut opts = MqttOptions::new(&self.client_id, &endpoint.host, endpoint.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some(creds) = &endpoint.credentials {
            opts.set_credentials(&creds.username, &creds.password);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, self.capacity);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(BusError::Transport(format!("connection refused: {:?}", ack.code)))
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(transport(e)),
                }
            }
        };
        timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| BusError::Timeout(self.handshake_timeout))??;

        Ok(MqttSession {
            client,
            eventloop,
            pending: VecDeque::new(),
            ack_timeout: self.handshake_timeout,
        })
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    // publishes that arrived while waiting for a SUBACK
    pending: VecDeque<InboundMessage>,
    ack_timeout: Duration,
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        self.client.subscribe(topic, QoS::AtMostOnce).await.map_err(transport)?;

        let eventloop = &mut self.eventloop;
        let pending = &mut self.pending;
        let wait_ack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                        let refused = ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure));
                        return if refused { Err(BusError::SubscribeRefused(topic.to_string())) } else { Ok(()) };
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => pending.push_back(InboundMessage {
                        topic: p.topic.clone(),
                        payload: p.payload.to_vec(),
                    }),
                    Ok(_) => {}
                    Err(e) => return Err(transport(e)),
                }
            }
        };
        timeout(self.ack_timeout, wait_ack)
            .await
            .map_err(|_| BusError::Timeout(self.ack_timeout))?
    }

    async fn next_message(&mut self) -> Result<InboundMessage, BusError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    return Ok(InboundMessage { topic: p.topic.clone(), payload: p.payload.to_vec() });
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    return Err(BusError::Transport("broker closed the session".into()));
                }
                Ok(_) => {}
                Err(e) => return Err(transport(e)),
            }
        }
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MqttPublisher { client: self.client.clone() })
    }

    async fn close(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        // drive the loop until DISCONNECT is actually written
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = timeout(Duration::from_millis(500), flush).await;
    }
}

struct MqttPublisher {
    client: AsyncClient,
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(transport)
    }
}
