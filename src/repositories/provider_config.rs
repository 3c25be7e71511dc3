//! Provider config repository for database operations

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, decrypt_secret, encrypt_secret};
use crate::error::BrokerError;
use crate::models::provider_config::{self, Entity as ProviderConfig};

/// Repository for provider config database operations
#[derive(Debug, Clone)]
pub struct ProviderConfigRepository {
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
}

fn secret_aad(environment_id: Uuid, unique_key: &str) -> String {
    format!("{environment_id}|{unique_key}")
}

impl ProviderConfigRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Finds a live provider config by its key.
    pub async fn find_by_key(
        &self,
        environment_id: Uuid,
        unique_key: &str,
    ) -> Result<Option<provider_config::Model>, BrokerError> {
        Ok(ProviderConfig::find()
            .filter(provider_config::Column::EnvironmentId.eq(environment_id))
            .filter(provider_config::Column::UniqueKey.eq(unique_key))
            .filter(provider_config::Column::Deleted.eq(false))
            .one(&*self.db)
            .await?)
    }

    /// Finds a live provider config or fails with `UNKNOWN_PROVIDER_CONFIG`.
    pub async fn get_required(
        &self,
        environment_id: Uuid,
        unique_key: &str,
    ) -> Result<provider_config::Model, BrokerError> {
        self.find_by_key(environment_id, unique_key)
            .await?
            .ok_or_else(|| BrokerError::UnknownProviderConfig(unique_key.to_string()))
    }

    /// Creates a provider config, encrypting the client secret at rest.
    pub async fn create(
        &self,
        environment_id: Uuid,
        unique_key: &str,
        provider: &str,
        oauth_client_id: Option<&str>,
        oauth_client_secret: Option<&str>,
        custom: Option<serde_json::Value>,
    ) -> Result<provider_config::Model, BrokerError> {
        let secret_ciphertext = oauth_client_secret
            .map(|secret| {
                encrypt_secret(
                    &self.crypto_key,
                    &secret_aad(environment_id, unique_key),
                    secret,
                )
            })
            .transpose()?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let active = provider_config::ActiveModel {
            id: Set(id),
            unique_key: Set(unique_key.to_string()),
            provider: Set(provider.to_string()),
            environment_id: Set(environment_id),
            oauth_client_id: Set(oauth_client_id.map(str::to_string)),
            oauth_client_secret_ciphertext: Set(secret_ciphertext),
            custom: Set(custom),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            deleted: Set(false),
            deleted_at: Set(None),
        };
        active.insert(&*self.db).await?;

        let fetched = ProviderConfig::find_by_id(id).one(&*self.db).await?;
        fetched
            .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("provider config not persisted")))
    }

    /// Decrypts the stored OAuth client secret, if any.
    pub fn decrypt_client_secret(
        &self,
        config: &provider_config::Model,
    ) -> Result<Option<String>, BrokerError> {
        config
            .oauth_client_secret_ciphertext
            .as_deref()
            .map(|ciphertext| {
                decrypt_secret(
                    &self.crypto_key,
                    &secret_aad(config.environment_id, &config.unique_key),
                    ciphertext,
                )
                .map_err(BrokerError::Crypto)
            })
            .transpose()
    }
}
