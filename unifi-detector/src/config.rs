use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_SITE;
use crate::error::StartupError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/unifi-detector/detector.toml";

/// One week
const MAX_SCAN_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
/// Ten years
const MAX_CLIENT_LIFESPAN_SECS: u64 = 10 * 365 * 24 * 60 * 60;
const MAX_TIMEOUT_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Status API is only served when this section is present
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifespanBoundary {
    /// `staleness <= lifespan` is fresh
    #[default]
    Inclusive,
    /// `staleness < lifespan` is fresh
    Exclusive,
}

/// What to do when a tick fires while an earlier cycle is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    #[default]
    Concurrent,
    SkipIfBusy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_client_lifespan")]
    pub client_lifespan_secs: u64,
    #[serde(default)]
    pub lifespan_boundary: LifespanBoundary,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_site")]
    pub site: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_controller_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_retain")]
    pub retain: bool,
    /// Defaults to `unifi-detector-<hostname>`
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Longest a single publish may take before it counts as failed
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_scan_interval() -> u64 {
    60
}

fn default_client_lifespan() -> u64 {
    3600
}

fn default_site() -> String {
    DEFAULT_SITE.to_string()
}

fn default_controller_timeout() -> u64 {
    60
}

fn default_retain() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    5
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            client_lifespan_secs: default_client_lifespan(),
            lifespan_boundary: LifespanBoundary::default(),
            overlap: OverlapPolicy::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            site: default_site(),
            insecure: false,
            timeout_secs: default_controller_timeout(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            topic: String::new(),
            qos: 0,
            retain: default_retain(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl DetectorConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Saturates instead of panicking; `validate` keeps real values far below that.
    pub fn client_lifespan(&self) -> chrono::Duration {
        i64::try_from(self.client_lifespan_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

impl MqttConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl Config {
    /// Load configuration, then apply `UNIFI_*` environment overrides.
    ///
    /// Without an explicit `path` a missing default file is not an error:
    /// every required setting must then come from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::read(default)?
                } else {
                    tracing::info!("No config file at {}; using environment only", DEFAULT_CONFIG_PATH);
                    Self::parse("")?
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Every setting the file carries may also come from a `UNIFI_*` variable,
    /// which wins over the file.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), StartupError> {
        let strings: [(&str, &mut String); 7] = [
            ("UNIFI_API_ADDRESS", &mut self.controller.address),
            ("UNIFI_API_USER", &mut self.controller.username),
            ("UNIFI_API_PASSWORD", &mut self.controller.password),
            ("UNIFI_MQTT_ADDRESS", &mut self.mqtt.address),
            ("UNIFI_MQTT_USER", &mut self.mqtt.username),
            ("UNIFI_MQTT_PASSWORD", &mut self.mqtt.password),
            ("UNIFI_MQTT_TOPIC", &mut self.mqtt.topic),
        ];
        for (key, field) in strings {
            if let Some(value) = lookup(key) {
                *field = value;
            }
        }

        let seconds: [(&str, &mut u64); 3] = [
            ("UNIFI_LIFESPAN", &mut self.detector.client_lifespan_secs),
            ("UNIFI_INTERVAL", &mut self.detector.scan_interval_secs),
            ("UNIFI_API_TIMEOUT", &mut self.controller.timeout_secs),
        ];
        for (key, field) in seconds {
            if let Some(value) = lookup(key) {
                *field = parse_number(key, &value)?;
            }
        }

        if let Some(value) = lookup("UNIFI_MQTT_QOS") {
            self.mqtt.qos = parse_number("UNIFI_MQTT_QOS", &value)?;
        }

        let flags: [(&str, &mut bool); 2] = [
            ("UNIFI_API_INSECURE", &mut self.controller.insecure),
            ("UNIFI_MQTT_RETAIN", &mut self.mqtt.retain),
        ];
        for (key, field) in flags {
            if let Some(value) = lookup(key) {
                *field = parse_flag(key, &value)?;
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        if self.controller.address.trim().is_empty() {
            return Err(StartupError::Config(
                "address for UniFi controller must be set".to_string(),
            ));
        }
        if self.mqtt.address.trim().is_empty() {
            return Err(StartupError::Config(
                "address for MQTT broker must be set".to_string(),
            ));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(StartupError::Config(
                "topic for MQTT broker must be set".to_string(),
            ));
        }
        if self.mqtt.qos > 2 {
            return Err(StartupError::Config(format!(
                "mqtt qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        check_range("scan interval", self.detector.scan_interval_secs, MAX_SCAN_INTERVAL_SECS)?;
        check_range("client lifespan", self.detector.client_lifespan_secs, MAX_CLIENT_LIFESPAN_SECS)?;
        check_range("controller timeout", self.controller.timeout_secs, MAX_TIMEOUT_SECS)?;
        check_range("mqtt publish timeout", self.mqtt.publish_timeout_secs, MAX_TIMEOUT_SECS)?;
        check_range("mqtt keep alive", self.mqtt.keep_alive_secs, u64::from(u16::MAX))?;
        Ok(())
    }
}

fn check_range(name: &str, secs: u64, max: u64) -> Result<(), StartupError> {
    if secs == 0 {
        return Err(StartupError::Config(format!(
            "{} must be at least one second",
            name
        )));
    }
    if secs > max {
        return Err(StartupError::Config(format!(
            "{} must be at most {} seconds, got {}",
            name, max, secs
        )));
    }
    Ok(())
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, StartupError> {
    value
        .trim()
        .parse()
        .map_err(|_| StartupError::Config(format!("{} must be a number, got {:?}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, StartupError> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(StartupError::Config(format!(
            "{} must be true or false, got {:?}",
            key, value
        ))),
    }
}
