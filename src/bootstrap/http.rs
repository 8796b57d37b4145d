//! HTTP endpoint for the bootstrap handshake
//!
//! The caller address comes from the accepted TCP connection, so the router
//! must be served with `into_make_service_with_connect_info::<SocketAddr>()`.
//! Forwarding headers are never consulted.

use super::BootstrapService;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Router exposing `GET /bootstrap/:instance_id`
pub struct BootstrapRouter {
    service: Arc<BootstrapService>,
}

impl BootstrapRouter {
    pub fn new(service: Arc<BootstrapService>) -> Self {
        Self { service }
    }

    pub fn build(self) -> Router {
        Router::new()
            .route("/bootstrap/:instance_id", get(bootstrap))
            .with_state(self.service)
    }
}

/// Accepts a raw key or `Bearer <key>`
fn credential_from(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string())
        .unwrap_or_default()
}

async fn bootstrap(
    State(service): State<Arc<BootstrapService>>,
    Path(instance_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let credential = credential_from(&headers);

    match service.handshake(&instance_id, peer.ip(), &credential).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            // Every failure looks the same to the caller
            warn!("Bootstrap for {} from {} failed: {}", instance_id, peer, e);
            (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "bootstrap_failed"})),
            )
                .into_response()
        }
    }
}
