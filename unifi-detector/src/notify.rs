use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::task::TaskTracker;
use shared::protocol::{DiscoveryMessage, HeartbeatMessage};
use shared::types::ClientRecord;
use crate::error::{NotifyError, PublishError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QualityOfService {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(other),
        }
    }
}

/// Message transport the notifier publishes through.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError>;
}

/// Where and how notifications are published
#[derive(Debug, Clone)]
pub struct Target {
    pub topic: String,
    pub qos: QualityOfService,
    pub retain: bool,
    /// Upper bound on a single publish
    pub timeout: Duration,
}

/// Sends heartbeats and discovery events.
///
/// Discoveries run as tracked background tasks; call [`Notifier::drain`]
/// to wait for the ones still in flight.
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn Publisher>,
    target: Arc<Target>,
    tracker: TaskTracker,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn Publisher>, target: Target) -> Self {
        Self {
            publisher,
            target: Arc::new(target),
            tracker: TaskTracker::new(),
        }
    }

    /// Publish a heartbeat for a snapshot of `clients` stations
    pub async fn heartbeat(&self, timestamp: DateTime<Utc>, clients: usize) {
        let message = HeartbeatMessage::new(timestamp, clients);
        match self.send(&message).await {
            Ok(()) => tracing::info!(clients, "Issued heartbeat"),
            Err(e) => tracing::error!("Failed to issue heartbeat: {}", e),
        }
    }

    /// Dispatch a discovery event without waiting for it to be published
    pub fn discovery(&self, record: &ClientRecord) {
        let message = DiscoveryMessage::from(record);
        let notifier = self.clone();
        self.tracker.spawn(async move {
            match notifier.send(&message).await {
                Ok(()) => tracing::debug!("Notified MQTT of client {}", message.mac),
                Err(e) => tracing::error!("Failed to notify of client {}: {}", message.mac, e),
            }
        });
    }

    /// Wait for every dispatched discovery to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn send<T: serde::Serialize>(&self, message: &T) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(message)?;
        let publish =
            self.publisher
                .publish(&self.target.topic, self.target.qos, self.target.retain, payload);
        tokio::time::timeout(self.target.timeout, publish)
            .await
            .map_err(|_| NotifyError::TimedOut(self.target.timeout))??;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;
    use super::*;

    /// Publisher that keeps every payload in memory
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub messages: Mutex<Vec<(String, serde_json::Value)>>,
        pub fail: bool,
    }

    impl RecordingPublisher {
        pub fn failing() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn heartbeats(&self) -> Vec<HeartbeatMessage> {
            self.decoded(|v| v.get("heartbeat").is_some())
        }

        pub fn discoveries(&self) -> Vec<DiscoveryMessage> {
            self.decoded(|v| v.get("mac").is_some())
        }

        fn decoded<T: serde::de::DeserializeOwned>(
            &self,
            filter: impl Fn(&serde_json::Value) -> bool,
        ) -> Vec<T> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, v)| filter(v))
                .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            _qos: QualityOfService,
            _retain: bool,
            payload: Vec<u8>,
        ) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            let value = serde_json::from_slice(&payload).unwrap();
            self.messages.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }
    }

    /// Publisher whose publishes never complete
    pub struct StalledPublisher;

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _qos: QualityOfService,
            _retain: bool,
            _payload: Vec<u8>,
        ) -> Result<(), PublishError> {
            std::future::pending().await
        }
    }

    pub fn test_target() -> Target {
        Target {
            topic: "unifi/clients".to_string(),
            qos: QualityOfService::AtMostOnce,
            retain: true,
            timeout: Duration::from_secs(5),
        }
    }
}
