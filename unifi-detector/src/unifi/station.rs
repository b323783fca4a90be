use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{ClientRecord, MacAddress};
use crate::error::RecordError;

/// A client as reported by the controller's `stat/sta` endpoint.
/// Every field is optional on the wire; [`Station::to_record`] decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub mac: Option<String>,
    pub hostname: Option<String>,
    /// Alias assigned on the controller
    pub name: Option<String>,
    pub ip: Option<String>,
    /// Unix seconds
    pub first_seen: Option<i64>,
    /// Unix seconds
    pub last_seen: Option<i64>,
}

impl Station {
    /// Validate this station into a client record
    pub fn to_record(&self) -> Result<ClientRecord, RecordError> {
        let raw_mac = self
            .mac
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(RecordError::MissingMac)?;
        let mac: MacAddress = raw_mac.parse().map_err(|source| RecordError::InvalidMac {
            value: raw_mac.to_string(),
            source,
        })?;

        let last_seen = self
            .last_seen
            .ok_or_else(|| RecordError::MissingLastSeen { mac: mac.to_string() })?;
        let last_seen = timestamp(&mac, last_seen)?;
        let first_seen = match self.first_seen {
            Some(secs) => timestamp(&mac, secs)?,
            None => last_seen,
        };

        let ip = match self.ip.as_deref().filter(|ip| !ip.is_empty()) {
            Some(value) => Some(value.parse::<IpAddr>().map_err(|_| RecordError::InvalidIp {
                mac: mac.to_string(),
                value: value.to_string(),
            })?),
            None => None,
        };

        let hostname = self
            .hostname
            .iter()
            .chain(self.name.iter())
            .find(|h| !h.is_empty())
            .cloned()
            .unwrap_or_default();

        Ok(ClientRecord {
            mac,
            hostname,
            ip,
            first_seen,
            last_seen,
        })
    }
}

fn timestamp(mac: &MacAddress, secs: i64) -> Result<DateTime<Utc>, RecordError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| RecordError::InvalidTimestamp {
        mac: mac.to_string(),
        value: secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn valid_station() -> Station {
        Station {
            mac: Some("00:11:22:AA:BB:CC".to_string()),
            hostname: Some("phone".to_string()),
            name: None,
            ip: Some("10.0.0.5".to_string()),
            first_seen: Some(1_700_000_000),
            last_seen: Some(1_700_000_600),
        }
    }

    #[test]
    fn test_valid_station() {
        let record = valid_station().to_record().unwrap();

        assert_eq!(record.mac.to_string(), "00:11:22:aa:bb:cc");
        assert_eq!(record.hostname, "phone");
        assert_eq!(record.ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert_eq!(record.first_seen.timestamp(), 1_700_000_000);
        assert_eq!(record.last_seen.timestamp(), 1_700_000_600);
    }

    #[test]
    fn test_optional_fields_fall_back() {
        let station = Station {
            hostname: None,
            name: Some("Living room TV".to_string()),
            ip: None,
            first_seen: None,
            ..valid_station()
        };
        let record = station.to_record().unwrap();

        assert_eq!(record.hostname, "Living room TV");
        assert_eq!(record.ip, None);
        assert_eq!(record.first_seen, record.last_seen);
    }

    #[test]
    fn test_malformed_stations() {
        let missing_mac = Station { mac: None, ..valid_station() };
        assert!(matches!(missing_mac.to_record(), Err(RecordError::MissingMac)));

        let bad_mac = Station { mac: Some("not-a-mac".to_string()), ..valid_station() };
        assert!(matches!(bad_mac.to_record(), Err(RecordError::InvalidMac { .. })));

        let no_last_seen = Station { last_seen: None, ..valid_station() };
        assert!(matches!(no_last_seen.to_record(), Err(RecordError::MissingLastSeen { .. })));

        let bad_ip = Station { ip: Some("10.0.0".to_string()), ..valid_station() };
        assert!(matches!(bad_ip.to_record(), Err(RecordError::InvalidIp { .. })));

        let bad_ts = Station { last_seen: Some(i64::MAX), ..valid_station() };
        assert!(matches!(bad_ts.to_record(), Err(RecordError::InvalidTimestamp { .. })));
    }

    #[test]
    fn test_deserialize_controller_json() {
        let station: Station = serde_json::from_str(
            r#"{"mac":"00:11:22:33:44:55","last_seen":1700000000,"oui":"Apple","is_wired":false}"#,
        )
        .unwrap();

        assert_eq!(station.mac.as_deref(), Some("00:11:22:33:44:55"));
        assert!(station.hostname.is_none());
        assert!(station.to_record().is_ok());
    }
}
