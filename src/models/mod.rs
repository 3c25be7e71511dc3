//! # Data Models
//!
//! SeaORM entities for the broker's storage tables.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod provider_config;

pub use connection::Entity as Connection;
pub use provider_config::Entity as ProviderConfig;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "keybridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
