//! # Server Configuration
//!
//! Wires the engine together (pool, crypto key, catalog, lock backend,
//! refresh coordinator, proxy executor) and exposes the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{any, get},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::catalog::ProviderCatalog;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::locking::{InMemoryKvStore, KvStore, RefreshLock};
use crate::proxy::ProxyExecutor;
use crate::refresh::RefreshCoordinator;
use crate::repositories::{ConnectionRepository, ProviderConfigRepository};
use crate::telemetry;
use crate::token_exchange::TokenExchanger;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub executor: Arc<ProxyExecutor>,
    pub shutdown: CancellationToken,
}

/// Builds the shared state from configuration and an open pool.
pub fn build_state(
    config: &AppConfig,
    db: DatabaseConnection,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let key_bytes = config
        .crypto_key
        .clone()
        .ok_or("crypto key is required; set KEYBRIDGE_CRYPTO_KEY")?;
    let crypto_key = CryptoKey::new(key_bytes)?;

    let catalog = match &config.provider_catalog_path {
        Some(path) => ProviderCatalog::from_file(path)?,
        None => ProviderCatalog::builtin(),
    };

    let db = Arc::new(db);
    let connections = ConnectionRepository::new(db.clone(), crypto_key.clone());
    let provider_configs = ProviderConfigRepository::new(db.clone(), crypto_key);

    let store = lock_store(config)?;
    let lock = RefreshLock::new(store, config.lock.clone());
    let exchanger =
        TokenExchanger::new(Duration::from_secs(config.refresh.request_timeout_seconds))?;
    let coordinator = RefreshCoordinator::new(
        connections,
        provider_configs,
        Arc::new(catalog),
        exchanger,
        lock,
        config.refresh.clone(),
    );
    let executor = ProxyExecutor::new(config.proxy_retry.clone())?;

    Ok(AppState {
        db,
        coordinator: Arc::new(coordinator),
        executor: Arc::new(executor),
        shutdown: CancellationToken::new(),
    })
}

#[cfg(feature = "redis-lock")]
fn lock_store(config: &AppConfig) -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    match &config.lock.redis_url {
        Some(url) => Ok(Arc::new(crate::locking::RedisKvStore::new(url)?)),
        None => Ok(Arc::new(InMemoryKvStore::new())),
    }
}

#[cfg(not(feature = "redis-lock"))]
fn lock_store(config: &AppConfig) -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    if config.lock.redis_url.is_some() {
        tracing::warn!(
            "KEYBRIDGE_LOCK_REDIS_URL is set but the redis-lock feature is not compiled in; \
             using the in-process lock store"
        );
    }
    Ok(Arc::new(InMemoryKvStore::new()))
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/v1/connections/{connection_id}",
            get(handlers::connections::get_connection)
                .delete(handlers::connections::delete_connection),
        )
        .route("/proxy/{*endpoint}", any(handlers::proxy::proxy_request))
        .layer(axum::middleware::from_fn(telemetry::propagate_trace_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given configuration
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = build_state(&config, db)?;
    let shutdown = state.shutdown.clone();
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::delete_connection,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::connections::ConnectionResponse,
        )
    ),
    info(
        title = "Keybridge API",
        description = "Credential broker: typed connection credentials, refresh coordination, and an authenticated provider proxy",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
