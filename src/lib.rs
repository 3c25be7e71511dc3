//! # Keybridge
//!
//! Multi-provider credential broker: stores typed connection credentials
//! encrypted at rest, keeps them fresh through coordinated refresh, and
//! proxies authenticated requests to provider APIs.

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod locking;
pub mod models;
pub mod proxy;
pub mod refresh;
pub mod repositories;
pub mod server;
pub mod signing;
pub mod telemetry;
pub mod template;
pub mod token_exchange;
