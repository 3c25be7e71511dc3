//! Connection credential endpoints
//!
//! Serving a connection always runs the freshness pipeline first, so the
//! credentials in the response are ready to use against the provider.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::error::{ApiError, BrokerError};
use crate::handlers::environment_id;
use crate::server::AppState;

/// Query parameters for fetching a connection
#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct GetConnectionQuery {
    /// Provider config the connection belongs to
    pub provider_config_key: String,
    /// Refresh the credentials even if they are not stale
    pub force_refresh: Option<bool>,
}

/// Query parameters for deleting a connection
#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct DeleteConnectionQuery {
    /// Provider config the connection belongs to
    pub provider_config_key: String,
}

/// A connection with decrypted, refreshed credentials
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionResponse {
    /// Row identifier
    #[schema(value_type = String)]
    pub id: Uuid,
    /// Caller-chosen connection id
    pub connection_id: String,
    pub provider_config_key: String,
    #[schema(value_type = String)]
    pub environment_id: Uuid,
    /// Typed credentials, tagged by auth mode
    #[schema(value_type = Object)]
    pub credentials: Credentials,
    /// Per-connection settings used for URL interpolation
    pub connection_config: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
    pub last_fetched_at: Option<String>,
}

fn rfc3339(value: DateTimeWithTimeZone) -> String {
    let utc: DateTime<Utc> = value.with_timezone(&Utc);
    utc.to_rfc3339()
}

/// Fetches a connection with fresh credentials
#[utoipa::path(
    get,
    path = "/v1/connections/{connection_id}",
    params(
        ("connection_id" = String, Path, description = "Caller-chosen connection id"),
        GetConnectionQuery,
    ),
    responses(
        (status = 200, description = "Connection with decrypted credentials", body = ConnectionResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Unknown connection or provider config", body = ApiError),
        (status = 502, description = "Upstream refresh failed", body = ApiError),
        (status = 503, description = "Refresh lock contention", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<GetConnectionQuery>,
    headers: HeaderMap,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let environment_id = environment_id(&headers)?;
    let force_refresh = query.force_refresh.unwrap_or(false);

    let (connection, credentials, _outcome) = state
        .coordinator
        .get_connection_credentials(
            environment_id,
            &connection_id,
            &query.provider_config_key,
            force_refresh,
        )
        .await?;

    Ok(Json(ConnectionResponse {
        id: connection.id,
        connection_id: connection.connection_id,
        provider_config_key: connection.provider_config_key,
        environment_id: connection.environment_id,
        credentials,
        connection_config: connection.connection_config,
        metadata: connection.metadata,
        created_at: rfc3339(connection.created_at),
        updated_at: rfc3339(connection.updated_at),
        last_fetched_at: connection.last_fetched_at.map(rfc3339),
    }))
}

/// Soft-deletes a connection, wiping its stored credentials
#[utoipa::path(
    delete,
    path = "/v1/connections/{connection_id}",
    params(
        ("connection_id" = String, Path, description = "Caller-chosen connection id"),
        DeleteConnectionQuery,
    ),
    responses(
        (status = 204, description = "Connection deleted"),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Unknown connection", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<DeleteConnectionQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let environment_id = environment_id(&headers)?;
    if connection_id.trim().is_empty() {
        return Err(BrokerError::MissingConnectionId.into());
    }
    if query.provider_config_key.trim().is_empty() {
        return Err(BrokerError::MissingProviderConfigKey.into());
    }

    let deleted = state
        .coordinator
        .connections()
        .soft_delete(environment_id, &connection_id, &query.provider_config_key)
        .await?;
    if !deleted {
        return Err(BrokerError::UnknownConnection {
            connection_id,
            provider_config_key: query.provider_config_key,
            environment_id,
        }
        .into());
    }
    Ok(StatusCode::NO_CONTENT)
}
