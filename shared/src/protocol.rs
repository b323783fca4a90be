use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::types::ClientRecord;

/// API path prefix for the status endpoints
pub const API_PREFIX: &str = "/v1";

/// Controller site queried when none is configured
pub const DEFAULT_SITE: &str = "default";

/// Published once per completed poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub timestamp: DateTime<Utc>,
    pub heartbeat: bool,
    /// Number of stations in the snapshot, including ones that failed validation
    pub clients: usize,
}

impl HeartbeatMessage {
    pub fn new(timestamp: DateTime<Utc>, clients: usize) -> Self {
        Self {
            timestamp,
            heartbeat: true,
            clients,
        }
    }
}

/// Published the first time a fresh client is seen while not cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hostname: String,
    pub mac: String,
    pub ip: Option<IpAddr>,
}

impl From<&ClientRecord> for DiscoveryMessage {
    fn from(record: &ClientRecord) -> Self {
        Self {
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            hostname: record.hostname.clone(),
            mac: record.mac.to_string(),
            ip: record.ip,
        }
    }
}
