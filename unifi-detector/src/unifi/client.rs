use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use crate::config::ControllerConfig;
use crate::error::{FetchError, RecordError};
use super::station::Station;
use super::{Observation, SnapshotSource};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Response envelope wrapped around every controller API payload.
/// Elements of `data` are decoded one at a time by the caller.
#[derive(Deserialize)]
struct Envelope {
    meta: Meta,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct Meta {
    rc: String,
    #[serde(default)]
    msg: Option<String>,
}

/// Session-based client for the UniFi controller API.
///
/// The session cookie lives in the HTTP client's cookie store. When the
/// controller rejects it, the session is dropped and the next fetch logs in
/// again before querying.
pub struct UnifiClient {
    http: reqwest::Client,
    base_url: String,
    site: String,
    username: String,
    password: String,
    authenticated: AtomicBool,
}

impl UnifiClient {
    pub fn new(config: &ControllerConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            site: config.site.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            authenticated: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.base_url
    }

    /// Authenticate and keep the session cookie
    pub async fn login(&self) -> Result<(), FetchError> {
        let response = self
            .http
            .post(format!("{}/api/login", self.base_url))
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.authenticated.store(false, Ordering::Release);
            return Err(FetchError::Auth(format!("login returned {}", status)));
        }

        self.authenticated.store(true, Ordering::Release);
        tracing::debug!("Authenticated to UniFi controller at {}", self.base_url);
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for UnifiClient {
    async fn fetch_snapshot(&self) -> Result<Vec<Observation>, FetchError> {
        if !self.authenticated.load(Ordering::Acquire) {
            self.login().await?;
        }

        let response = self
            .http
            .get(format!("{}/api/s/{}/stat/sta", self.base_url, self.site))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.authenticated.store(false, Ordering::Release);
            return Err(FetchError::Auth(format!("station query returned {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Controller(format!("station query returned {}", status)));
        }

        let body = response.bytes().await?;
        let envelope: Envelope =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;

        if envelope.meta.rc != "ok" {
            let msg = envelope.meta.msg.unwrap_or_else(|| envelope.meta.rc.clone());
            if msg == "api.err.LoginRequired" {
                self.authenticated.store(false, Ordering::Release);
                return Err(FetchError::Auth(msg));
            }
            return Err(FetchError::Controller(msg));
        }

        Ok(envelope
            .data
            .into_iter()
            .map(|value| {
                serde_json::from_value::<Station>(value)
                    .map_err(|e| RecordError::Undecodable(e.to_string()))
            })
            .collect())
    }
}
