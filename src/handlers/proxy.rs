//! Authenticated provider proxy endpoint
//!
//! Accepts any method under `/proxy/{*endpoint}`, resolves the connection
//! named by the control headers, injects authentication, and relays the
//! provider response verbatim. Control headers are consumed here and never
//! forwarded upstream.

use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Multipart, Path, RawQuery, State},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use serde_json::{Map, Value as JsonValue};

use crate::error::ApiError;
use crate::handlers::environment_id;
use crate::proxy::{
    FilePart, ProxyBody, ProxyCall, RetryPolicy, build_proxy_request, strip_sensitive_headers,
};
use crate::server::AppState;
use crate::token_exchange::ClientCredentials;

const CONNECTION_ID_HEADER: &str = "connection-id";
const PROVIDER_CONFIG_KEY_HEADER: &str = "provider-config-key";
const RETRIES_HEADER: &str = "retries";
const BASE_URL_OVERRIDE_HEADER: &str = "base-url-override";
const RETRY_ON_HEADER: &str = "retry-on";
const RETRY_HEADER_HEADER: &str = "retry-header";

/// Headers consumed by the broker rather than forwarded.
const CONTROL_HEADERS: &[&str] = &[
    CONNECTION_ID_HEADER,
    PROVIDER_CONFIG_KEY_HEADER,
    RETRIES_HEADER,
    BASE_URL_OVERRIDE_HEADER,
    RETRY_ON_HEADER,
    RETRY_HEADER_HEADER,
    super::ENVIRONMENT_HEADER,
];

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn json_object(value: Option<&JsonValue>) -> Map<String, JsonValue> {
    match value {
        Some(JsonValue::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

async fn read_body(headers: &HeaderMap, body: Bytes) -> Result<ProxyBody, ApiError> {
    let content_type = header_str(headers, "content-type").unwrap_or("");
    if content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return parse_multipart(content_type, body).await;
    }
    Ok(if body.is_empty() {
        ProxyBody::Empty
    } else {
        ProxyBody::Raw(body.to_vec())
    })
}

/// Decompose the caller's multipart body into data fields and file parts so
/// the executor can re-serialize it upstream with a fresh boundary.
async fn parse_multipart(content_type: &str, body: Bytes) -> Result<ProxyBody, ApiError> {
    fn invalid(message: String) -> ApiError {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_MULTIPART_BODY".to_string(),
            message,
        )
    }

    let request = axum::http::Request::builder()
        .header("content-type", content_type)
        .body(Body::from(body))
        .map_err(|e| invalid(e.to_string()))?;
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| invalid(e.to_string()))?;

    let mut fields = Vec::new();
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let part_content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(|e| invalid(e.to_string()))?;
        if file_name.is_some() {
            files.push(FilePart {
                field: name,
                file_name,
                content_type: part_content_type,
                bytes: data.to_vec(),
            });
        } else {
            fields.push((name, String::from_utf8_lossy(&data).into_owned()));
        }
    }
    Ok(ProxyBody::Multipart { fields, files })
}

pub async fn proxy_request(
    State(state): State<AppState>,
    method: Method,
    Path(endpoint): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let environment_id = environment_id(&headers)?;
    let connection_id = header_str(&headers, CONNECTION_ID_HEADER)
        .ok_or_else(|| ApiError::from(crate::error::BrokerError::MissingConnectionId))?;
    let provider_config_key = header_str(&headers, PROVIDER_CONFIG_KEY_HEADER)
        .ok_or_else(|| ApiError::from(crate::error::BrokerError::MissingProviderConfigKey))?;

    let retries: u32 = header_str(&headers, RETRIES_HEADER)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let retry_on: Vec<u16> = header_str(&headers, RETRY_ON_HEADER)
        .map(|v| {
            v.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    let retry_header = header_str(&headers, RETRY_HEADER_HEADER).map(str::to_string);
    let base_url_override = header_str(&headers, BASE_URL_OVERRIDE_HEADER);

    let (connection, credentials, _outcome) = state
        .coordinator
        .get_connection_credentials(environment_id, connection_id, provider_config_key, false)
        .await?;
    let config = state
        .coordinator
        .provider_configs()
        .get_required(environment_id, provider_config_key)
        .await?;
    let template = state.coordinator.catalog().get(&config.provider)?;
    let client = ClientCredentials {
        client_id: config.oauth_client_id.clone(),
        client_secret: state
            .coordinator
            .provider_configs()
            .decrypt_client_secret(&config)?,
    };

    let forwarded_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !CONTROL_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let endpoint = match &query {
        Some(query) => format!("{endpoint}?{query}"),
        None => endpoint,
    };
    let connection_config = json_object(connection.connection_config.as_ref());

    let call = ProxyCall {
        method: method.as_str(),
        endpoint: &endpoint,
        headers: forwarded_headers,
        body: read_body(&headers, body).await?,
        base_url_override,
        template,
        credentials: &credentials,
        connection_config: &connection_config,
        client: &client,
    };
    let built = build_proxy_request(&call)?;

    tracing::debug!(
        environment_id = %environment_id,
        provider = %config.provider,
        connection_id = %connection_id,
        method = %built.method,
        url = %built.url,
        headers = ?strip_sensitive_headers(&built.headers, &built.sensitive_values),
        "proxying request upstream"
    );

    let policy = RetryPolicy {
        max_retries: retries,
        retry_on,
        retry_header,
        hints: template
            .proxy
            .as_ref()
            .map(|proxy| proxy.retry.clone())
            .unwrap_or_default(),
    };
    let upstream = state
        .executor
        .execute(&built, &policy, &state.shutdown.child_token())
        .await?;

    let mut response = Response::builder().status(
        StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    for (name, value) in &upstream.headers {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(Body::from(upstream.body))
        .map_err(|e| ApiError::from(crate::error::BrokerError::Internal(anyhow::anyhow!(e))))
}
