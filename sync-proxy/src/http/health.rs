//! Health check endpoint.

use crate::server::SyncProxy;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of known targets.
    pub targets: usize,
    /// Number of targets marked active.
    pub active: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(proxy): Extension<Arc<SyncProxy>>) -> Json<HealthStatus> {
    let registry = proxy.registry();
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        targets: registry.len(),
        active: registry.active_count(),
        uptime_seconds: proxy.uptime().as_secs(),
    })
}
