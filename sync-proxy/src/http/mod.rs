//! HTTP endpoints for syncproxy.
//!
//! The control API starts and stops per-target syncing. Health and metrics
//! endpoints are unauthenticated.

pub mod health;
mod metrics;

use crate::error::ControlError;
use crate::server::SyncProxy;
use crate::target::TargetUpdate;
use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use syncproxy_types::{errcode, MatrixError, TargetId};

pub use health::HealthStatus;

/// Control API path prefix.
pub const CONTROL_PREFIX: &str = "/_matrix/client/unstable/fi.mau.syncproxy";

/// Build the HTTP router with all endpoints.
pub fn build_router(proxy: Arc<SyncProxy>) -> Router {
    Router::new()
        .route(
            &format!("{CONTROL_PREFIX}/:appservice_id"),
            put(put_target_handler).delete(delete_target_handler),
        )
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(proxy))
}

/// A Matrix-style JSON error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: MatrixError,
}

impl ApiError {
    fn new(status: StatusCode, errcode: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: MatrixError::new(errcode, message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let message = err.to_string();
        match err {
            ControlError::NotFound => Self::new(StatusCode::NOT_FOUND, errcode::NOT_FOUND, message),
            ControlError::NotActive => {
                Self::new(StatusCode::NOT_FOUND, errcode::NOT_ACTIVE, message)
            }
            ControlError::InvalidAddress(_) => {
                Self::new(StatusCode::BAD_REQUEST, errcode::INVALID_ADDRESS, message)
            }
            ControlError::UpsertFailed(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                errcode::UPSERT_FAILED,
                message,
            ),
            ControlError::StopTimeout => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, errcode::STOP_TIMEOUT, message)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    access_token: Option<String>,
}

/// Check the shared secret from the `Authorization` header or the
/// `access_token` query parameter.
fn check_auth(
    proxy: &SyncProxy,
    headers: &HeaderMap,
    query: &AuthQuery,
) -> Result<(), ApiError> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = from_header.or(query.access_token.as_deref()) else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            errcode::MISSING_TOKEN,
            "Missing access token",
        ));
    };
    if token != proxy.config().server.shared_secret {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            errcode::UNKNOWN_TOKEN,
            "Invalid access token",
        ));
    }
    Ok(())
}

async fn put_target_handler(
    Extension(proxy): Extension<Arc<SyncProxy>>,
    Path(appservice_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_auth(&proxy, &headers, &query)?;
    let update: TargetUpdate = serde_json::from_slice(&body).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            errcode::BAD_JSON,
            format!("Failed to parse request JSON: {err}"),
        )
    })?;
    proxy
        .put_target(TargetId::new(appservice_id), update)
        .await?;
    Ok(Json(json!({})))
}

async fn delete_target_handler(
    Extension(proxy): Extension<Arc<SyncProxy>>,
    Path(appservice_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    check_auth(&proxy, &headers, &query)?;
    proxy.stop_target(&TargetId::new(appservice_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
