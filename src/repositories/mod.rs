//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for
//! database entities, with environment-scoped lookups and credential
//! encryption at the boundary.

pub mod connection;
pub mod provider_config;

pub use connection::ConnectionRepository;
pub use provider_config::ProviderConfigRepository;
