//! Tracing setup and per-request trace IDs.
//!
//! Every request runs inside [`propagate_trace_id`], which scopes a trace ID
//! (taken from the caller's `x-request-id` or freshly generated) into
//! task-local storage and echoes it back on the response. Error payloads
//! read it through [`current_trace_id`].

use std::sync::OnceLock;

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use log::LevelFilter;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt,
};
use uuid::Uuid;

use crate::config::AppConfig;

const REQUEST_ID_HEADER: &str = "x-request-id";

task_local! {
    static TRACE_ID: String;
}

static TRACING_STARTED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once. `log::` macros (sea-orm, sqlx) are
/// bridged into tracing; filter and output format come from configuration,
/// with `RUST_LOG` taking precedence over the configured level.
pub fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    if TRACING_STARTED.set(()).is_err() {
        return Ok(());
    }

    // The bridge may already be installed by a test harness.
    let _ = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let output = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing subscriber install: {e}"))?;
    Ok(())
}

/// Middleware scoping a trace ID over the request and echoing it back in
/// the `x-request-id` response header.
pub async fn propagate_trace_id(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let echo = HeaderValue::from_str(&trace_id).ok();
    let mut response = TRACE_ID.scope(trace_id, next.run(request)).await;
    if let Some(value) = echo {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Trace ID of the running request, when inside [`propagate_trace_id`].
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}
