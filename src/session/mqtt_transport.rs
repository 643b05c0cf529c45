//! Controller event channel over MQTT
//!
//! Outbound events are published to `<root>/pendant/<event>`, inbound events
//! arrive on `<root>/controller/<event>`; payloads are JSON.

use super::transport::{ControllerTransport, TransportError, TransportEvent};
use crate::config::SessionConfig;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 100;
const KEEP_ALIVE: Duration = Duration::from_secs(5);

pub struct MqttTransport {
    config: SessionConfig,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
}

impl MqttTransport {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            client: None,
            eventloop: None,
        }
    }

    fn outbound_topic(&self, event: &str) -> String {
        format!("{}/pendant/{}", self.config.topic_root, event)
    }

    fn inbound_filter(&self) -> String {
        format!("{}/controller/+", self.config.topic_root)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(password)) =
            (&self.config.broker_user, &self.config.broker_password)
        {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }

    fn drop_link(&mut self) {
        self.client = None;
        self.eventloop = None;
    }
}

/// Event name from an inbound topic, if it belongs to us
fn inbound_event<'a>(topic_root: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(topic_root)?
        .strip_prefix("/controller/")
        .filter(|event| !event.is_empty() && !event.contains('/'))
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(other) => debug!("Waiting for ConnAck, got {:?}", other),
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

#[async_trait]
impl ControllerTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.drop_link();
        info!(
            "Connecting to broker {}:{} as {}",
            self.config.host, self.config.port, self.config.client_id
        );

        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        }

        let filter = self.inbound_filter();
        client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Connect(format!("subscribe {}: {}", filter, e)))?;
        debug!("Subscribed to {}", filter);

        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(())
    }

    async fn send(
        &mut self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let topic = self.outbound_topic(event);
        let client = self.client.as_ref().ok_or_else(|| TransportError::Send {
            event: event.to_string(),
            reason: "not connected".to_string(),
        })?;
        let bytes = serde_json::to_vec(&payload).map_err(|source| TransportError::Encode {
            event: event.to_string(),
            source,
        })?;

        client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| TransportError::Send {
                event: event.to_string(),
                reason: e.to_string(),
            })
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(eventloop) = self.eventloop.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(event) = inbound_event(&self.config.topic_root, &publish.topic)
                    else {
                        debug!("Ignoring message on {}", publish.topic);
                        continue;
                    };
                    match serde_json::from_slice(&publish.payload) {
                        Ok(payload) => {
                            return TransportEvent::Message {
                                event: event.to_string(),
                                payload,
                            }
                        }
                        Err(e) => warn!("Undecodable '{}' payload: {}", event, e),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.drop_link();
                    return TransportEvent::Closed {
                        reason: "broker sent disconnect".to_string(),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    self.drop_link();
                    return TransportEvent::Closed {
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self) {
        let (Some(client), Some(mut eventloop)) = (self.client.take(), self.eventloop.take())
        else {
            return;
        };
        if let Err(e) = client.disconnect().await {
            debug!("Disconnect request failed: {}", e);
            return;
        }
        // Drive the loop until the disconnect is on the wire
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        info!("Broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_topics_map_to_event_names() {
        assert_eq!(inbound_event("cnc", "cnc/controller/status"), Some("status"));
        assert_eq!(inbound_event("cnc", "cnc/controller/authAck"), Some("authAck"));
        assert_eq!(inbound_event("cnc", "cnc/pendant/command"), None);
        assert_eq!(inbound_event("cnc", "cnc/controller/"), None);
        assert_eq!(inbound_event("cnc", "cnc/controller/a/b"), None);
        assert_eq!(inbound_event("cnc", "other/controller/status"), None);
    }

    #[test]
    fn outbound_topics_live_under_the_root() {
        let transport = MqttTransport::new(SessionConfig {
            topic_root: "shop/mill".to_string(),
            ..SessionConfig::default()
        });
        assert_eq!(
            transport.outbound_topic("credentials"),
            "shop/mill/pendant/credentials"
        );
        assert_eq!(transport.inbound_filter(), "shop/mill/controller/+");
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let mut transport = MqttTransport::new(SessionConfig::default());
        assert!(matches!(
            transport.send("heartbeat", serde_json::json!({})).await,
            Err(TransportError::Send { .. })
        ));
    }
}
