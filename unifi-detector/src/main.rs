mod api;
mod cache;
mod cache_manager;
mod config;
mod detector;
mod error;
mod mqtt;
mod notify;
mod poller;
mod unifi;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::cache::store::PresenceCache;
use crate::cache_manager::CacheHandle;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::detector::Policy;
use crate::error::StartupError;
use crate::mqtt::MqttPublisher;
use crate::notify::{Notifier, QualityOfService, Target};
use crate::poller::Poller;
use crate::unifi::client::UnifiClient;

const VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " version:", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> Result<()> {
    let arg = std::env::args().nth(1);
    if matches!(arg.as_deref(), Some("--version" | "-V")) {
        println!("{}", VERSION);
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("unifi_detector=info"))
        )
        .init();

    tracing::info!("{}", VERSION);

    // Load config
    let config_path = arg.map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load config")?;

    tracing::info!(
        "Loaded config from {}",
        config_path.as_deref().unwrap_or(Path::new(DEFAULT_CONFIG_PATH)).display()
    );

    // Connect to the controller before anything else; a bad login is fatal
    let controller = UnifiClient::new(&config.controller).map_err(StartupError::Controller)?;
    controller.login().await.map_err(StartupError::Controller)?;
    tracing::info!("Successfully connected to UniFi at {}", controller.address());

    // Connect to the broker
    let client_id = match &config.mqtt.client_id {
        Some(id) => id.clone(),
        None => {
            let hostname = hostname::get()
                .context("Failed to get system hostname")?
                .to_string_lossy()
                .to_string();
            format!("unifi-detector-{}", hostname)
        }
    };
    // The event loop outlives the poller so pending notifications still go out
    let mqtt_cancel = CancellationToken::new();
    let (publisher, mqtt_handle) =
        MqttPublisher::connect(&config.mqtt, client_id, mqtt_cancel.clone()).await?;
    let publisher = Arc::new(publisher);
    tracing::info!("Successfully connected to MQTT broker at {}", config.mqtt.address);

    let qos = QualityOfService::try_from(config.mqtt.qos)
        .map_err(|qos| StartupError::Config(format!("unsupported mqtt qos {}", qos)))?;
    let notifier = Notifier::new(
        publisher.clone(),
        Target {
            topic: config.mqtt.topic.clone(),
            qos,
            retain: config.mqtt.retain,
            timeout: config.mqtt.publish_timeout(),
        },
    );

    // Start cache thread
    let (count_tx, count_rx) = watch::channel(0);
    let cache_handle = CacheHandle::spawn(PresenceCache::new(), count_tx);

    let policy = Policy {
        lifespan: config.detector.client_lifespan(),
        boundary: config.detector.lifespan_boundary,
    };
    let (poller, state_rx) =
        Poller::new(Arc::new(controller), cache_handle.clone(), notifier, policy);

    // Fetch the initial list of clients without announcing them
    if poller.seed().await.is_some() {
        tracing::info!("Seeded cache with {} clients", *count_rx.borrow());
    }

    let cancel = CancellationToken::new();

    // Spawn poller task
    let poll_cancel = cancel.clone();
    let poll_interval = config.detector.scan_interval();
    let overlap = config.detector.overlap;
    let poll_handle = tokio::spawn(async move {
        poller.run(poll_interval, overlap, poll_cancel).await;
    });

    // Optional status API
    let server_handle = match &config.api {
        Some(api_config) => {
            let app = api::routes::router(api::routes::AppState {
                cache: cache_handle.clone(),
                count_rx,
                state_rx,
            });

            let listener = tokio::net::TcpListener::bind(&api_config.listen)
                .await
                .with_context(|| format!("Failed to bind to {}", api_config.listen))?;
            tracing::info!("API listening on {}", api_config.listen);

            let server_cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                    .await
                {
                    tracing::error!("Server error: {}", e);
                }
            }))
        }
        None => None,
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Stop ticking and let in-flight cycles and notifications finish
    cancel.cancel();
    let _ = poll_handle.await;
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    publisher.disconnect().await;
    mqtt_cancel.cancel();
    let _ = mqtt_handle.await;

    // Shutdown cache thread
    if let Err(e) = cache_handle.shutdown().await {
        tracing::error!("Failed to shutdown cache: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
