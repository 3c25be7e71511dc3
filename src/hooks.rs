//! Collaborator hook interfaces
//!
//! Surrounding systems (sync scheduling, notifications) observe connection
//! lifecycle events through [`LifecycleHooks`]. The broker never depends on
//! what the hooks do; every method defaults to a no-op.

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::BrokerError;
use crate::models::connection;
use crate::repositories::connection::UpsertOperation;

/// Lifecycle notifications fired by the refresh coordinator.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Fired after a connection is created or overridden through
    /// [`crate::refresh::RefreshCoordinator::save_connection`].
    async fn connection_created(
        &self,
        _connection: &connection::Model,
        _provider: &str,
        _operation: UpsertOperation,
    ) {
    }

    async fn refresh_succeeded(&self, _connection: &connection::Model, _provider: &str) {}

    async fn refresh_failed(
        &self,
        _connection: &connection::Model,
        _provider: &str,
        _error: &BrokerError,
    ) {
    }
}

/// Hooks implementation that does nothing.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {}

/// Freshness signal for providers whose tokens must be checked upstream
/// instead of against a stored expiry.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    /// Whether the credential should be refreshed despite having no expired
    /// timestamp.
    async fn is_stale(
        &self,
        _connection: &connection::Model,
        _credentials: &Credentials,
    ) -> Result<bool, BrokerError> {
        Ok(false)
    }
}

/// Introspector that always reports tokens as fresh.
pub struct NeverStale;

#[async_trait]
impl TokenIntrospector for NeverStale {}
