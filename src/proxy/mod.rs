//! Authenticated proxying of caller requests to provider APIs
//!
//! The builder turns a caller request plus stored credentials into a fully
//! authenticated upstream request; the executor sends it with rate-limit
//! aware retries and relays the provider response verbatim.

pub mod builder;
pub mod executor;

pub use builder::{BuiltRequest, FilePart, ProxyBody, ProxyCall, build_proxy_request};
pub use executor::{ProxyExecutor, RetryPolicy, UpstreamResponse, strip_sensitive_headers};
