use shared::types::MacParseError;
use thiserror::Error;

/// Failure to obtain a snapshot. Skips the current cycle only.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("controller unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("controller rejected credentials: {0}")]
    Auth(String),

    #[error("controller returned an error: {0}")]
    Controller(String),

    #[error("failed to decode controller response: {0}")]
    Decode(String),
}

/// A station that cannot be turned into a client record. Skips that station only.
#[derive(Debug, Clone, Error)]
pub enum RecordError {
    #[error("station has no mac address")]
    MissingMac,

    #[error("invalid mac address {value:?}: {source}")]
    InvalidMac {
        value: String,
        #[source]
        source: MacParseError,
    },

    #[error("station {mac} has no last_seen timestamp")]
    MissingLastSeen { mac: String },

    #[error("station {mac} has out of range timestamp {value}")]
    InvalidTimestamp { mac: String, value: i64 },

    #[error("station {mac} has invalid ip {value:?}")]
    InvalidIp { mac: String, value: String },

    #[error("station could not be decoded: {0}")]
    Undecodable(String),
}

#[derive(Debug, Error)]
#[error("publish to {topic} failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// A notification that could not be sent. Never aborts a cycle.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to serialize notification: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("publish did not complete within {0:?}")]
    TimedOut(std::time::Duration),
}

/// Failures before the first seed run. These terminate the process.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to connect to UniFi controller: {0}")]
    Controller(#[source] FetchError),

    #[error("failed to connect to MQTT broker: {0}")]
    Broker(String),
}
