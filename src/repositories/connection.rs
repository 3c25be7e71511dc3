//! Connection repository for database operations
//!
//! Encapsulates SeaORM operations for the connections table. All lookups are
//! environment-scoped and exclude soft-deleted rows. Credential blobs are
//! encrypted and decrypted here so callers only ever see typed credentials.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::crypto::{CryptoKey, decrypt_credentials, encrypt_credentials, is_encrypted_payload};
use crate::error::BrokerError;
use crate::models::connection::{self, Entity as Connection};

/// Whether an upsert created a new row or replaced a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOperation {
    Creation,
    Override,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for credential encryption
    pub crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Finds a live connection by its natural key.
    pub async fn find(
        &self,
        environment_id: Uuid,
        connection_id: &str,
        provider_config_key: &str,
    ) -> Result<Option<connection::Model>, BrokerError> {
        Ok(Connection::find()
            .filter(connection::Column::EnvironmentId.eq(environment_id))
            .filter(connection::Column::ConnectionId.eq(connection_id))
            .filter(connection::Column::ProviderConfigKey.eq(provider_config_key))
            .filter(connection::Column::Deleted.eq(false))
            .one(&*self.db)
            .await?)
    }

    /// Finds a live connection or fails with `UNKNOWN_CONNECTION`.
    pub async fn get_required(
        &self,
        environment_id: Uuid,
        connection_id: &str,
        provider_config_key: &str,
    ) -> Result<connection::Model, BrokerError> {
        self.find(environment_id, connection_id, provider_config_key)
            .await?
            .ok_or_else(|| BrokerError::UnknownConnection {
                connection_id: connection_id.to_string(),
                provider_config_key: provider_config_key.to_string(),
                environment_id,
            })
    }

    /// Creates a connection, or replaces the credentials and config of the
    /// live row with the same natural key.
    pub async fn upsert(
        &self,
        environment_id: Uuid,
        connection_id: &str,
        provider_config_key: &str,
        config_id: Uuid,
        credentials: &Credentials,
        connection_config: Option<serde_json::Value>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(connection::Model, UpsertOperation), BrokerError> {
        let ciphertext = encrypt_credentials(
            &self.crypto_key,
            environment_id,
            provider_config_key,
            connection_id,
            credentials,
        )?;
        let now = Utc::now();

        if let Some(existing) = self
            .find(environment_id, connection_id, provider_config_key)
            .await?
        {
            let mut active: connection::ActiveModel = existing.into();
            active.credentials_ciphertext = Set(Some(ciphertext));
            if connection_config.is_some() {
                active.connection_config = Set(connection_config);
            }
            if metadata.is_some() {
                active.metadata = Set(metadata);
            }
            active.updated_at = Set(now.into());
            return Ok((active.update(&*self.db).await?, UpsertOperation::Override));
        }

        let id = Uuid::new_v4();
        let active = connection::ActiveModel {
            id: Set(id),
            connection_id: Set(connection_id.to_string()),
            provider_config_key: Set(provider_config_key.to_string()),
            config_id: Set(config_id),
            environment_id: Set(environment_id),
            credentials_ciphertext: Set(Some(ciphertext)),
            connection_config: Set(connection_config),
            metadata: Set(metadata),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            last_fetched_at: Set(None),
            deleted: Set(false),
            deleted_at: Set(None),
        };
        active.insert(&*self.db).await?;

        let fetched = Connection::find_by_id(id).one(&*self.db).await?;
        fetched
            .map(|model| (model, UpsertOperation::Creation))
            .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("connection not persisted")))
    }

    /// Lists live connections in an environment.
    pub async fn list_by_environment(
        &self,
        environment_id: Uuid,
    ) -> Result<Vec<connection::Model>, BrokerError> {
        Ok(Connection::find()
            .filter(connection::Column::EnvironmentId.eq(environment_id))
            .filter(connection::Column::Deleted.eq(false))
            .all(&*self.db)
            .await?)
    }

    /// Finds live connections whose connection config holds `value` under
    /// `key`. JSON predicates differ across backends, so rows are filtered
    /// after the environment scan.
    pub async fn find_by_config_value(
        &self,
        environment_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<Vec<connection::Model>, BrokerError> {
        let rows = self.list_by_environment(environment_id).await?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                row.connection_config
                    .as_ref()
                    .and_then(|config| config.get(key))
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| v == value)
            })
            .collect())
    }

    /// Shallow-merges new keys into the stored metadata map.
    pub async fn merge_metadata(
        &self,
        connection: &connection::Model,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<connection::Model, BrokerError> {
        let mut merged = match &connection.metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        merged.extend(patch.clone());

        let mut active: connection::ActiveModel = connection.clone().into();
        active.metadata = Set(Some(serde_json::Value::Object(merged)));
        active.updated_at = Set(Utc::now().into());
        Ok(active.update(&*self.db).await?)
    }

    /// Shallow-merges new keys into the stored connection config.
    pub async fn merge_connection_config(
        &self,
        connection: &connection::Model,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<connection::Model, BrokerError> {
        let mut merged = match &connection.connection_config {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        merged.extend(patch.clone());
        self.replace_connection_config(connection, serde_json::Value::Object(merged))
            .await
    }

    /// Replaces the stored connection config wholesale.
    pub async fn replace_connection_config(
        &self,
        connection: &connection::Model,
        config: serde_json::Value,
    ) -> Result<connection::Model, BrokerError> {
        let mut active: connection::ActiveModel = connection.clone().into();
        active.connection_config = Set(Some(config));
        active.updated_at = Set(Utc::now().into());
        Ok(active.update(&*self.db).await?)
    }

    /// Decrypts the credential blob of a connection.
    pub fn decrypt(&self, connection: &connection::Model) -> Result<Credentials, BrokerError> {
        let ciphertext = connection.credentials_ciphertext.as_deref().ok_or_else(|| {
            BrokerError::UnknownConnection {
                connection_id: connection.connection_id.clone(),
                provider_config_key: connection.provider_config_key.clone(),
                environment_id: connection.environment_id,
            }
        })?;

        if !is_encrypted_payload(ciphertext) {
            tracing::warn!(
                environment_id = %connection.environment_id,
                provider_config_key = %connection.provider_config_key,
                connection_id = %connection.connection_id,
                "legacy plaintext credential blob detected"
            );
        }

        decrypt_credentials(
            &self.crypto_key,
            connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
            ciphertext,
        )
        .map_err(|e| {
            tracing::error!(
                environment_id = %connection.environment_id,
                provider_config_key = %connection.provider_config_key,
                connection_id = %connection.connection_id,
                "credential decryption failed"
            );
            BrokerError::Crypto(e)
        })
    }

    /// Persists refreshed credentials, bumping `updated_at` and
    /// `last_fetched_at`.
    pub async fn update_credentials(
        &self,
        connection: &connection::Model,
        credentials: &Credentials,
    ) -> Result<connection::Model, BrokerError> {
        let ciphertext = encrypt_credentials(
            &self.crypto_key,
            connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
            credentials,
        )?;
        let now = Utc::now();

        let mut active: connection::ActiveModel = connection.clone().into();
        active.credentials_ciphertext = Set(Some(ciphertext));
        active.updated_at = Set(now.into());
        active.last_fetched_at = Set(Some(now.into()));
        Ok(active.update(&*self.db).await?)
    }

    /// Bumps `last_fetched_at` without touching credentials. Called on every
    /// credential read, including failed refresh attempts.
    pub async fn touch_last_fetched(
        &self,
        connection: &connection::Model,
    ) -> Result<(), BrokerError> {
        let mut active: connection::ActiveModel = connection.clone().into();
        active.last_fetched_at = Set(Some(Utc::now().into()));
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Soft-deletes a connection, wiping its credential blob. Returns false
    /// when no live row matched.
    pub async fn soft_delete(
        &self,
        environment_id: Uuid,
        connection_id: &str,
        provider_config_key: &str,
    ) -> Result<bool, BrokerError> {
        let Some(existing) = self
            .find(environment_id, connection_id, provider_config_key)
            .await?
        else {
            return Ok(false);
        };

        let now = Utc::now();
        let mut active: connection::ActiveModel = existing.into();
        active.deleted = Set(true);
        active.deleted_at = Set(Some(now.into()));
        active.updated_at = Set(now.into());
        active.credentials_ciphertext = Set(None);
        active.update(&*self.db).await?;
        Ok(true)
    }
}
