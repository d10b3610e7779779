//! `rumqttc` backend for the broker traits (MQTT 3.1.1).

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;

use super::{BrokerEvent, BrokerEvents, BrokerTransport, Connector, InboundMessage};
use crate::config::BrokerConfig;
use crate::error::{BridgeError, Result};

/// Opens `rumqttc` client/event-loop pairs with clean sessions
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
    channel_capacity: usize,
}

impl MqttConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            keep_alive: Duration::from_secs(config.keep_alive_s),
            channel_capacity: config.channel_capacity,
        }
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }
}

impl Connector for MqttConnector {
    fn open(&self, client_id: &str) -> (Arc<dyn BrokerTransport>, Box<dyn BrokerEvents>) {
        let (client, eventloop) = AsyncClient::new(self.options(client_id), self.channel_capacity);
        (
            Arc::new(MqttTransport { client }),
            Box::new(MqttEvents { eventloop }),
        )
    }
}

struct MqttTransport {
    client: AsyncClient,
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::Subscribe(format!("{}: {}", filter, e)))
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Broker(e.to_string()))
    }
}

struct MqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl BrokerEvents for MqttEvents {
    async fn next_event(&mut self) -> Result<BrokerEvent> {
        let event = self
            .eventloop
            .poll()
            .await
            .map_err(|e| BridgeError::Broker(e.to_string()))?;

        Ok(translate(event))
    }
}

fn translate(event: Event) -> BrokerEvent {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => BrokerEvent::ConnAck,
        Event::Incoming(Packet::Publish(publish)) => {
            BrokerEvent::Message(InboundMessage::new(publish.topic, publish.payload))
        }
        Event::Incoming(Packet::SubAck(ack)) => BrokerEvent::SubAck {
            pkid: ack.pkid,
            granted: ack
                .return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
        },
        Event::Outgoing(Outgoing::Subscribe(pkid)) => BrokerEvent::SubscribeSent(pkid),
        Event::Outgoing(Outgoing::Disconnect) => BrokerEvent::Disconnected,
        _ => BrokerEvent::Other,
    }
}
