//! Credential read path and refresh coordination
//!
//! Every credential read flows through [`RefreshCoordinator::get_connection_credentials`]:
//! decrypt, decide staleness, and when stale refresh under a distributed lock
//! so that concurrent readers of the same connection produce a single
//! upstream token request. Contenders that lose the race pick up the winner's
//! result from the store instead of refreshing again.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::catalog::{ProviderCatalog, ProviderMetadata, ProviderTemplate};
use crate::config::RefreshConfig;
use crate::credentials::{Credentials, is_token_expired};
use crate::error::BrokerError;
use crate::hooks::{LifecycleHooks, NeverStale, NoopHooks, TokenIntrospector};
use crate::locking::{AcquireOutcome, KvStore, RefreshLock};
use crate::models::{connection, provider_config};
use crate::repositories::connection::UpsertOperation;
use crate::repositories::{ConnectionRepository, ProviderConfigRepository};
use crate::token_exchange::{ClientCredentials, TokenExchanger};

/// How the served credentials were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Stored credentials were fresh enough to serve as-is.
    Fresh,
    /// This call refreshed the credentials upstream.
    Refreshed,
    /// Another contender refreshed while we waited; their result was served.
    PiggyBacked,
}

pub struct RefreshCoordinator {
    connections: ConnectionRepository,
    provider_configs: ProviderConfigRepository,
    catalog: Arc<ProviderCatalog>,
    exchanger: TokenExchanger,
    lock: RefreshLock<dyn KvStore>,
    refresh_config: RefreshConfig,
    hooks: Arc<dyn LifecycleHooks>,
    introspector: Arc<dyn TokenIntrospector>,
}

impl RefreshCoordinator {
    pub fn new(
        connections: ConnectionRepository,
        provider_configs: ProviderConfigRepository,
        catalog: Arc<ProviderCatalog>,
        exchanger: TokenExchanger,
        lock: RefreshLock<dyn KvStore>,
        refresh_config: RefreshConfig,
    ) -> Self {
        Self {
            connections,
            provider_configs,
            catalog,
            exchanger,
            lock,
            refresh_config,
            hooks: Arc::new(NoopHooks),
            introspector: Arc::new(NeverStale),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_introspector(mut self, introspector: Arc<dyn TokenIntrospector>) -> Self {
        self.introspector = introspector;
        self
    }

    pub fn connections(&self) -> &ConnectionRepository {
        &self.connections
    }

    pub fn provider_configs(&self) -> &ProviderConfigRepository {
        &self.provider_configs
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    /// Create a connection, or replace the stored credentials of the live
    /// row with the same natural key. Fires the connection-created hook so
    /// sync scheduling and other collaborators can react.
    pub async fn save_connection(
        &self,
        environment_id: Uuid,
        connection_id: &str,
        provider_config_key: &str,
        credentials: &Credentials,
        connection_config: Option<JsonValue>,
        metadata: Option<JsonValue>,
    ) -> Result<(connection::Model, UpsertOperation), BrokerError> {
        if environment_id.is_nil() {
            return Err(BrokerError::MissingEnvironment);
        }
        if connection_id.trim().is_empty() {
            return Err(BrokerError::MissingConnectionId);
        }
        if provider_config_key.trim().is_empty() {
            return Err(BrokerError::MissingProviderConfigKey);
        }

        let config = self
            .provider_configs
            .get_required(environment_id, provider_config_key)
            .await?;
        // Reject providers missing from the catalog before writing anything.
        self.catalog.get(&config.provider)?;

        let (connection, operation) = self
            .connections
            .upsert(
                environment_id,
                connection_id,
                provider_config_key,
                config.id,
                credentials,
                connection_config,
                metadata,
            )
            .await?;
        self.hooks
            .connection_created(&connection, &config.provider, operation)
            .await;
        metrics::counter!("keybridge_connections_saved_total").increment(1);
        Ok((connection, operation))
    }

    /// Serve the credentials of a connection, refreshing first when stale.
    ///
    /// `last_fetched_at` is bumped on every call that reaches the store,
    /// including calls whose refresh attempt fails.
    pub async fn get_connection_credentials(
        &self,
        environment_id: Uuid,
        connection_id: &str,
        provider_config_key: &str,
        force_refresh: bool,
    ) -> Result<(connection::Model, Credentials, ServeOutcome), BrokerError> {
        if environment_id.is_nil() {
            return Err(BrokerError::MissingEnvironment);
        }
        if connection_id.trim().is_empty() {
            return Err(BrokerError::MissingConnectionId);
        }
        if provider_config_key.trim().is_empty() {
            return Err(BrokerError::MissingProviderConfigKey);
        }

        let connection = self
            .connections
            .get_required(environment_id, connection_id, provider_config_key)
            .await?;
        let config = self
            .provider_configs
            .get_required(environment_id, provider_config_key)
            .await?;
        let template = self.catalog.get(&config.provider)?;
        let credentials = self.connections.decrypt(&connection)?;

        if !credentials.is_refreshable() {
            self.connections.touch_last_fetched(&connection).await?;
            metrics::counter!("keybridge_credentials_served_total").increment(1);
            return Ok((connection, credentials, ServeOutcome::Fresh));
        }

        match self
            .refresh_if_needed(&connection, &config, template, credentials, force_refresh)
            .await
        {
            Ok((connection, credentials, outcome)) => {
                // A refresh already stamped last_fetched_at via the
                // credential update.
                if outcome != ServeOutcome::Refreshed {
                    self.connections.touch_last_fetched(&connection).await?;
                }
                if outcome == ServeOutcome::Refreshed {
                    self.hooks
                        .refresh_succeeded(&connection, &config.provider)
                        .await;
                    metrics::counter!("keybridge_refresh_success_total").increment(1);
                }
                metrics::counter!("keybridge_credentials_served_total").increment(1);
                Ok((connection, credentials, outcome))
            }
            Err(error) => {
                self.connections.touch_last_fetched(&connection).await?;
                self.hooks
                    .refresh_failed(&connection, &config.provider, &error)
                    .await;
                metrics::counter!("keybridge_refresh_failure_total").increment(1);
                tracing::warn!(
                    environment_id = %environment_id,
                    provider_config_key = %provider_config_key,
                    connection_id = %connection_id,
                    code = error.code(),
                    "credential refresh failed"
                );
                Err(error)
            }
        }
    }

    async fn refresh_if_needed(
        &self,
        connection: &connection::Model,
        config: &provider_config::Model,
        template: &ProviderTemplate,
        credentials: Credentials,
        force_refresh: bool,
    ) -> Result<(connection::Model, Credentials, ServeOutcome), BrokerError> {
        let stale = self
            .is_stale(connection, template, &credentials, force_refresh)
            .await?;
        if !stale {
            return Ok((connection.clone(), credentials, ServeOutcome::Fresh));
        }

        let key = RefreshLock::<dyn KvStore>::key(
            connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
        );
        match self.lock.acquire(&key).await? {
            AcquireOutcome::Acquired { owner } => {
                let result = self
                    .refresh_under_lock(connection, config, template, force_refresh)
                    .await;
                // The lease lapses on its own TTL; a failed release must not
                // discard the refresh outcome.
                if let Err(release_error) = self.lock.release(&key, &owner).await {
                    tracing::warn!(
                        key = %key,
                        error = %release_error,
                        "refresh lock release failed"
                    );
                }
                result
            }
            AcquireOutcome::TimedOut => {
                // One recheck: the holder may have finished and released late.
                let current = self
                    .connections
                    .get_required(
                        connection.environment_id,
                        &connection.connection_id,
                        &connection.provider_config_key,
                    )
                    .await?;
                let current_credentials = self.connections.decrypt(&current)?;
                if current.updated_at > connection.updated_at
                    || !self
                        .is_stale(&current, template, &current_credentials, false)
                        .await?
                {
                    return Ok((current, current_credentials, ServeOutcome::PiggyBacked));
                }
                metrics::counter!("keybridge_refresh_lock_timeout_total").increment(1);
                Err(BrokerError::LockTimeout { key })
            }
        }
    }

    /// Runs with the lock held. Re-reads the row first so a refresh that
    /// completed while we queued is served instead of repeated.
    async fn refresh_under_lock(
        &self,
        connection: &connection::Model,
        config: &provider_config::Model,
        template: &ProviderTemplate,
        force_refresh: bool,
    ) -> Result<(connection::Model, Credentials, ServeOutcome), BrokerError> {
        let current = self
            .connections
            .get_required(
                connection.environment_id,
                &connection.connection_id,
                &connection.provider_config_key,
            )
            .await?;
        let current_credentials = self.connections.decrypt(&current)?;

        if current.updated_at > connection.updated_at {
            return Ok((current, current_credentials, ServeOutcome::PiggyBacked));
        }
        if !force_refresh
            && !self
                .is_stale(&current, template, &current_credentials, false)
                .await?
        {
            return Ok((current, current_credentials, ServeOutcome::Fresh));
        }

        let client = ClientCredentials {
            client_id: config.oauth_client_id.clone(),
            client_secret: self.provider_configs.decrypt_client_secret(config)?,
        };
        let custom = json_object(config.custom.as_ref());
        let connection_config = json_object(current.connection_config.as_ref());

        let renewed = self
            .exchanger
            .renew(
                template,
                &client,
                &custom,
                &connection_config,
                &current_credentials,
            )
            .await?;
        let updated = self.connections.update_credentials(&current, &renewed).await?;
        Ok((updated, renewed, ServeOutcome::Refreshed))
    }

    async fn is_stale(
        &self,
        connection: &connection::Model,
        template: &ProviderTemplate,
        credentials: &Credentials,
        force_refresh: bool,
    ) -> Result<bool, BrokerError> {
        if !has_refresh_material(credentials, &template.metadata) {
            return Ok(false);
        }
        if force_refresh {
            return Ok(true);
        }
        if template.metadata.introspection {
            return self.introspector.is_stale(connection, credentials).await;
        }
        Ok(is_expiring(
            credentials,
            &template.metadata,
            self.refresh_config.expiration_buffer_seconds,
        ))
    }
}

/// Staleness against the stored expiry, honoring a per-provider buffer
/// override. Credentials without an expiry never count as stale here.
fn is_expiring(
    credentials: &Credentials,
    metadata: &ProviderMetadata,
    default_buffer_seconds: u64,
) -> bool {
    let buffer = metadata
        .token_expiration_buffer_seconds
        .unwrap_or(default_buffer_seconds) as i64;
    match credentials.expires_at() {
        Some(expires_at) => is_token_expired(expires_at, buffer),
        None => false,
    }
}

/// An OAUTH2 credential without a stored refresh token has nothing to renew
/// with, so it never counts as needing refresh and is served as-is until
/// replaced. Providers that re-issue from the access token alone are exempt.
fn has_refresh_material(credentials: &Credentials, metadata: &ProviderMetadata) -> bool {
    match credentials {
        Credentials::Oauth2 { refresh_token, .. } => {
            refresh_token.is_some() || !metadata.refresh_requires_refresh_token
        }
        _ => true,
    }
}

fn json_object(value: Option<&JsonValue>) -> Map<String, JsonValue> {
    match value {
        Some(JsonValue::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
