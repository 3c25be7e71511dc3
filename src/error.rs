//! # Error Handling
//!
//! Domain failures are modeled by [`BrokerError`] with stable
//! SCREAMING_SNAKE_CASE codes; the HTTP layer converts them into a
//! problem+json [`ApiError`] with trace ID propagation. Error payloads
//! carry identifiers only, never credential material.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::credentials::AuthMode;
use crate::crypto::CryptoError;
use crate::telemetry;

/// Failures the broker can produce while resolving, refreshing, or
/// proxying credentials.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("a connection id must be provided")]
    MissingConnectionId,
    #[error("a provider config key must be provided")]
    MissingProviderConfigKey,
    #[error("an environment must be provided")]
    MissingEnvironment,
    #[error("an endpoint or base URL override must be provided")]
    MissingEndpoint,
    #[error("provider '{provider}' has no base API URL; pass a base URL override")]
    MissingBaseApiUrl { provider: String },
    #[error("no connection '{connection_id}' for provider config '{provider_config_key}'")]
    UnknownConnection {
        connection_id: String,
        provider_config_key: String,
        environment_id: Uuid,
    },
    #[error("unknown provider config '{0}'")]
    UnknownProviderConfig(String),
    #[error("provider '{0}' is not in the catalog")]
    UnknownProviderTemplate(String),
    #[error("token response is missing required fields for {auth_mode}")]
    IncompleteCredentials { auth_mode: AuthMode },
    #[error("OAuth1 connections cannot be proxied")]
    PassThrough,
    #[error("token endpoint rejected the refresh: {message}")]
    RefreshTokenExternal { message: String },
    #[error("client-credentials request was rejected: {message}")]
    InvalidClientCredentials { message: String },
    #[error("Tableau sign-in was rejected: {message}")]
    InvalidTableauCredentials { message: String },
    #[error("timed out waiting for refresh lock '{key}'")]
    LockTimeout { key: String },
    #[error("request failed after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// Stable machine-readable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::MissingConnectionId => "MISSING_CONNECTION_ID",
            BrokerError::MissingProviderConfigKey => "MISSING_PROVIDER_CONFIG_KEY",
            BrokerError::MissingEnvironment => "MISSING_ENVIRONMENT",
            BrokerError::MissingEndpoint => "MISSING_ENDPOINT",
            BrokerError::MissingBaseApiUrl { .. } => "MISSING_BASE_API_URL",
            BrokerError::UnknownConnection { .. } => "UNKNOWN_CONNECTION",
            BrokerError::UnknownProviderConfig(_) => "UNKNOWN_PROVIDER_CONFIG",
            BrokerError::UnknownProviderTemplate(_) => "UNKNOWN_PROVIDER_TEMPLATE",
            BrokerError::IncompleteCredentials { .. } => "INCOMPLETE_RAW_CREDENTIALS",
            BrokerError::PassThrough => "PASS_THROUGH_ERROR",
            BrokerError::RefreshTokenExternal { .. } => "REFRESH_TOKEN_EXTERNAL_ERROR",
            BrokerError::InvalidClientCredentials { .. } => "INVALID_CLIENT_CREDENTIALS",
            BrokerError::InvalidTableauCredentials { .. } => "INVALID_TABLEAU_CREDENTIALS",
            BrokerError::LockTimeout { .. } => "LOCK_TIMEOUT",
            BrokerError::Transport { .. } => "TRANSPORT_ERROR",
            BrokerError::Crypto(_) => "CRYPTO_ERROR",
            BrokerError::Database(_) => "INTERNAL_SERVER_ERROR",
            BrokerError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status the error maps to at the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::MissingConnectionId
            | BrokerError::MissingProviderConfigKey
            | BrokerError::MissingEnvironment
            | BrokerError::MissingEndpoint
            | BrokerError::MissingBaseApiUrl { .. }
            | BrokerError::PassThrough => StatusCode::BAD_REQUEST,
            BrokerError::UnknownConnection { .. }
            | BrokerError::UnknownProviderConfig(_)
            | BrokerError::UnknownProviderTemplate(_) => StatusCode::NOT_FOUND,
            BrokerError::IncompleteCredentials { .. }
            | BrokerError::RefreshTokenExternal { .. }
            | BrokerError::InvalidClientCredentials { .. }
            | BrokerError::InvalidTableauCredentials { .. }
            | BrokerError::Transport { .. } => StatusCode::BAD_GATEWAY,
            BrokerError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Crypto(_) | BrokerError::Database(_) | BrokerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::LockTimeout { .. } | BrokerError::Transport { .. }
        )
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        let status = error.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = error.code(), "internal error: {:?}", error);
            return Self::new(status, error.code(), "An internal error occurred");
        }

        let mut api = Self::new(status, error.code(), &error.to_string());
        if matches!(error, BrokerError::LockTimeout { .. }) {
            api = api.with_retry_after(1);
        }
        api
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

/// Truncate an upstream body for inclusion in error messages.
pub fn body_snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}
