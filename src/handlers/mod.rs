//! HTTP endpoint handlers.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use uuid::Uuid;

use crate::error::{ApiError, BrokerError};
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod connections;
pub mod proxy;

/// Header carrying the environment scope for every broker operation.
pub const ENVIRONMENT_HEADER: &str = "environment-id";

/// Resolve the environment scope from the request headers.
pub(crate) fn environment_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let value = headers
        .get(ENVIRONMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::from(BrokerError::MissingEnvironment))?;
    Uuid::parse_str(value).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "MISSING_ENVIRONMENT",
            "environment-id header is not a valid UUID",
        )
    })
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness and database health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Database is unreachable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    crate::db::health_check(&state.db).await.map_err(|_| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "DATABASE_UNAVAILABLE",
            "database health check failed",
        )
    })?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
