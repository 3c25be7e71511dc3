//! Test utilities for database-backed tests.
//!
//! Builds an in-memory SQLite database from the entity definitions and wires
//! a full refresh coordinator against it, with the lock store and token
//! exchanger swappable per test.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use uuid::Uuid;

use keybridge::catalog::ProviderCatalog;
use keybridge::config::{LockConfig, RefreshConfig};
use keybridge::credentials::Credentials;
use keybridge::crypto::CryptoKey;
use keybridge::locking::{InMemoryKvStore, KvStore, RefreshLock};
use keybridge::models::{connection, provider_config};
use keybridge::refresh::RefreshCoordinator;
use keybridge::repositories::{ConnectionRepository, ProviderConfigRepository};
use keybridge::token_exchange::TokenExchanger;

pub const TEST_KEY: [u8; 32] = [7u8; 32];

pub fn test_key() -> CryptoKey {
    CryptoKey::new(TEST_KEY.to_vec()).expect("32-byte key")
}

/// In-memory SQLite database with the broker tables created from the
/// entities.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    db.execute(backend.build(&schema.create_table_from_entity(connection::Entity)))
        .await?;
    db.execute(backend.build(&schema.create_table_from_entity(provider_config::Entity)))
        .await?;
    Ok(Arc::new(db))
}

pub struct TestBroker {
    pub db: Arc<DatabaseConnection>,
    pub connections: ConnectionRepository,
    pub provider_configs: ProviderConfigRepository,
    pub coordinator: RefreshCoordinator,
    pub environment_id: Uuid,
}

/// Coordinator wired to an in-memory database and the given catalog and
/// lock store.
pub async fn broker_with_store(
    catalog: ProviderCatalog,
    store: Arc<dyn KvStore>,
) -> Result<TestBroker> {
    let db = setup_test_db().await?;
    let key = test_key();
    let connections = ConnectionRepository::new(db.clone(), key.clone());
    let provider_configs = ProviderConfigRepository::new(db.clone(), key);

    let lock = RefreshLock::new(store, LockConfig::default());
    let exchanger = TokenExchanger::new(Duration::from_secs(5))?;
    let coordinator = RefreshCoordinator::new(
        connections.clone(),
        provider_configs.clone(),
        Arc::new(catalog),
        exchanger,
        lock,
        RefreshConfig::default(),
    );

    Ok(TestBroker {
        db,
        connections,
        provider_configs,
        coordinator,
        environment_id: Uuid::new_v4(),
    })
}

pub async fn broker(catalog: ProviderCatalog) -> Result<TestBroker> {
    broker_with_store(catalog, Arc::new(InMemoryKvStore::new())).await
}

impl TestBroker {
    /// Registers a provider config and a connection holding `credentials`.
    pub async fn seed_connection(
        &self,
        provider: &str,
        provider_config_key: &str,
        connection_id: &str,
        credentials: &Credentials,
        connection_config: Option<serde_json::Value>,
    ) -> Result<connection::Model> {
        let config = self
            .provider_configs
            .create(
                self.environment_id,
                provider_config_key,
                provider,
                Some("client-id"),
                Some("client-secret"),
                None,
            )
            .await?;
        let (model, _) = self
            .connections
            .upsert(
                self.environment_id,
                connection_id,
                provider_config_key,
                config.id,
                credentials,
                connection_config,
                None,
            )
            .await?;
        Ok(model)
    }
}

/// Single-provider catalog whose token endpoint points at `token_url`.
pub fn oauth2_catalog(provider: &str, token_url: &str) -> ProviderCatalog {
    let json = serde_json::json!([{
        "name": provider,
        "auth_mode": "OAUTH2",
        "token_url": token_url,
        "proxy": { "base_url": "https://api.example.com" }
    }]);
    ProviderCatalog::from_json_str(&json.to_string()).expect("valid catalog")
}
