use std::time::Duration;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::MqttConfig;
use crate::error::{PublishError, StartupError};
use crate::notify::{Publisher, QualityOfService};

const DEFAULT_PORT: u16 = 1883;

/// Publisher backed by an MQTT broker connection
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Connect and wait for the broker's CONNACK, then keep the event loop
    /// running in the background until `cancel` fires.
    pub async fn connect(
        config: &MqttConfig,
        client_id: String,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), StartupError> {
        let (host, port) = parse_broker_address(&config.address)?;

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => return Err(StartupError::Broker(e.to_string())),
            }
        }

        let driver = tokio::spawn(drive(eventloop, cancel));
        Ok((Self { client }, driver))
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!("Failed to disconnect from MQTT broker: {}", e);
        }
    }
}

/// Poll the event loop so queued publishes reach the broker. A failed poll
/// is retried after a pause, which makes rumqttc reconnect.
async fn drive(mut eventloop: EventLoop, cancel: CancellationToken) {
    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("MQTT event loop shutting down");
                break;
            }
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        let qos = match qos {
            QualityOfService::AtMostOnce => QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
        };

        // Queues without waiting; a full request queue while the broker is
        // unreachable fails this publish instead of stalling the caller.
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| PublishError {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Split `host[:port]`, tolerating a `tcp://` or `mqtt://` scheme
fn parse_broker_address(address: &str) -> Result<(String, u16), StartupError> {
    let address = address
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');

    let invalid = || StartupError::Config(format!("invalid MQTT broker address: {address:?}"));

    // Bracketed IPv6, e.g. [fd00::1]:1883
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
        }
        Some(_) => Err(invalid()),
        None if !address.is_empty() => Ok((address.to_string(), DEFAULT_PORT)),
        None => Err(invalid()),
    }
}
