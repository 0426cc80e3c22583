use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::protocol::Wait;
use shared::types::{filter_group, ServiceEntry, DEFAULT_GROUP_SEPARATOR};
use crate::beacon::BeaconHandle;
use crate::config::BeaconConfig;

#[derive(Clone)]
pub struct AppState {
    pub beacon: BeaconHandle,
    pub config: Arc<BeaconConfig>,
    pub hostname: String,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub hostname: String,
    pub control_port: u16,
    pub broadcast_port: u16,
    pub broadcast_interval_ms: u64,
    pub advert_ttl_ms: u64,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    pub group: Option<String>,
    pub separator: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/config", get(get_config))
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:name", get(get_service))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        hostname: state.hostname.clone(),
        control_port: state.config.control_port,
        broadcast_port: state.config.broadcast_port,
        broadcast_interval_ms: state.config.broadcast_interval_ms,
        advert_ttl_ms: state.config.advert_ttl_ms,
    })
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<Vec<ServiceEntry>>, StatusCode> {
    let services = state.beacon.discover_all().await.map_err(|e| {
        tracing::error!("Failed to query services: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let services = match params.group {
        Some(group) => {
            let separator = params.separator.as_deref().unwrap_or(DEFAULT_GROUP_SEPARATOR);
            filter_group(services, &group, separator, &[])
        }
        None => services,
    };

    Ok(Json(services.into_iter().map(ServiceEntry::from).collect()))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.beacon.hash()
}

async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceEntry>, StatusCode> {
    state
        .beacon
        .discover(&name, Wait::For(std::time::Duration::ZERO))
        .await
        .map_err(|e| {
            tracing::error!("Failed to query service: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .map(|address| Json(ServiceEntry { name, address }))
        .ok_or(StatusCode::NOT_FOUND)
}
