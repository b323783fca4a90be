use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::MacAddress;
use crate::cache::store::CacheEntry;
use crate::cache_manager::CacheHandle;
use crate::poller::PollerState;

#[derive(Clone)]
pub struct AppState {
    pub cache: CacheHandle,
    pub count_rx: watch::Receiver<usize>,
    pub state_rx: watch::Receiver<PollerState>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub state: PollerState,
    pub clients: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/health"), get(get_health))
        .route(&format!("{API_PREFIX}/clients"), get(get_clients))
        .route(&format!("{API_PREFIX}/clients/:mac"), get(get_client))
        .with_state(state)
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        state: *state.state_rx.borrow(),
        clients: *state.count_rx.borrow(),
    })
}

async fn get_clients(State(state): State<AppState>) -> Result<Json<Vec<CacheEntry>>, StatusCode> {
    state.cache.get_all().await.map(Json).map_err(|e| {
        tracing::error!("Failed to query clients: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_client(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<CacheEntry>, StatusCode> {
    let mac: MacAddress = mac.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    state
        .cache
        .lookup(mac)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query client: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
