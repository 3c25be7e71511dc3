//! Upstream request construction
//!
//! Resolves the target URL from the catalog template (or a caller override),
//! injects authentication for every credential family, overlays template
//! headers and query bindings, and finally applies caller headers so the
//! caller always wins. TBA requests are signed over the final URL.

use chrono::Utc;
use reqwest::Method;
use serde_json::{Map, Value as JsonValue};
use url::Url;

use crate::catalog::ProviderTemplate;
use crate::credentials::{AuthMode, Credentials};
use crate::error::BrokerError;
use crate::signing::{OAuth1SigningParams, generate_nonce, oauth1_auth_header, tba_realm};
use crate::template::{interpolate, resolve_base_url};
use crate::token_exchange::ClientCredentials;

/// Headers never forwarded upstream.
const DROPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

/// One file attached to a multipart request.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name the file was posted under.
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Body of a proxied request.
#[derive(Debug, Clone, Default)]
pub enum ProxyBody {
    #[default]
    Empty,
    /// Forwarded byte-for-byte.
    Raw(Vec<u8>),
    /// Re-serialized upstream as `multipart/form-data`: the caller's data
    /// fields plus any attached files.
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

/// Caller request plus the resolved connection context.
pub struct ProxyCall<'a> {
    pub method: &'a str,
    /// Provider-relative endpoint, or an absolute URL embedding the base.
    pub endpoint: &'a str,
    /// Caller headers, applied last.
    pub headers: Vec<(String, String)>,
    pub body: ProxyBody,
    pub base_url_override: Option<&'a str>,
    pub template: &'a ProviderTemplate,
    pub credentials: &'a Credentials,
    pub connection_config: &'a Map<String, JsonValue>,
    /// Client material from the provider config, used as the TBA consumer
    /// pair when the credential carries no override.
    pub client: &'a ClientCredentials,
}

/// A request ready to send, plus the secret values to redact from any log
/// output about it.
#[derive(Debug)]
pub struct BuiltRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: ProxyBody,
    pub sensitive_values: Vec<String>,
}

pub fn build_proxy_request(call: &ProxyCall<'_>) -> Result<BuiltRequest, BrokerError> {
    let endpoint = call.endpoint.trim();
    if endpoint.is_empty() {
        return Err(BrokerError::MissingEndpoint);
    }
    let method = Method::from_bytes(call.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| BrokerError::Internal(anyhow::anyhow!("invalid http method")))?;

    let base_url = match call.base_url_override {
        Some(override_url) if !override_url.trim().is_empty() => {
            interpolate(override_url.trim(), call.connection_config)
        }
        _ => {
            let template_base = call
                .template
                .proxy
                .as_ref()
                .map(|proxy| proxy.base_url.as_str())
                .unwrap_or("");
            if template_base.is_empty() {
                return Err(BrokerError::MissingBaseApiUrl {
                    provider: call.template.name.clone(),
                });
            }
            resolve_base_url(template_base, call.connection_config)
        }
    };

    let mut url = join_url(&base_url, endpoint, call.connection_config);
    let mut sensitive_values = Vec::new();

    // Template query bindings, typically `${apiKey}`.
    if let Some(proxy) = &call.template.proxy
        && !proxy.query.is_empty()
    {
        let mut parsed = Url::parse(&url)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid proxy url: {e}")))?;
        for (key, value) in &proxy.query {
            let value = bind_template_value(value, call.credentials, call.connection_config)?;
            parsed.query_pairs_mut().append_pair(key, &value);
        }
        url = parsed.into();
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    apply_auth(
        call,
        &method,
        &url,
        &mut headers,
        &mut sensitive_values,
    )?;

    if let Some(proxy) = &call.template.proxy {
        for (name, value) in &proxy.headers {
            let value = bind_template_value(value, call.credentials, call.connection_config)?;
            set_header(&mut headers, name, value);
        }
    }

    for (name, value) in &call.headers {
        if DROPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        set_header(&mut headers, name, value.clone());
    }

    // A re-serialized multipart body gets a new boundary; the caller's
    // content-type no longer describes it.
    if matches!(call.body, ProxyBody::Multipart { .. }) {
        headers.retain(|(name, _)| name != "content-type");
    }

    Ok(BuiltRequest {
        method,
        url,
        headers,
        body: call.body.clone(),
        sensitive_values,
    })
}

/// Join base and endpoint with exactly one slash. An endpoint that embeds
/// the base URL is accepted and not doubled.
fn join_url(base_url: &str, endpoint: &str, config: &Map<String, JsonValue>) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = match endpoint.strip_prefix(base) {
        Some(rest) => rest,
        None => endpoint,
    };
    interpolate(
        &format!("{}/{}", base, endpoint.trim_start_matches('/')),
        config,
    )
}

fn apply_auth(
    call: &ProxyCall<'_>,
    method: &Method,
    url: &str,
    headers: &mut Vec<(String, String)>,
    sensitive_values: &mut Vec<String>,
) -> Result<(), BrokerError> {
    use base64::{Engine as _, engine::general_purpose};

    match call.credentials {
        Credentials::Oauth1 { .. } => return Err(BrokerError::PassThrough),
        Credentials::Oauth2 { access_token, .. }
        | Credentials::App { access_token, .. }
        | Credentials::AppStore { access_token, .. } => {
            sensitive_values.push(access_token.clone());
            set_header(headers, "authorization", format!("Bearer {access_token}"));
        }
        Credentials::Oauth2Cc { token, .. } | Credentials::Tableau { token, .. } => {
            sensitive_values.push(token.clone());
            set_header(headers, "authorization", format!("Bearer {token}"));
        }
        Credentials::ApiKey { api_key, .. } => {
            // Carried by template query or header bindings; nothing default.
            sensitive_values.push(api_key.clone());
        }
        Credentials::Basic {
            username, password, ..
        } => {
            let pair = format!("{}:{}", username, password.as_deref().unwrap_or(""));
            let encoded = general_purpose::STANDARD.encode(pair);
            if let Some(password) = password {
                sensitive_values.push(password.clone());
            }
            sensitive_values.push(encoded.clone());
            set_header(headers, "authorization", format!("Basic {encoded}"));
        }
        Credentials::Tba {
            token_id,
            token_secret,
            config_override,
            ..
        } => {
            let consumer_key = config_override
                .client_id
                .as_deref()
                .or(call.client.client_id.as_deref())
                .ok_or(BrokerError::IncompleteCredentials {
                    auth_mode: AuthMode::Tba,
                })?;
            let consumer_secret = config_override
                .client_secret
                .as_deref()
                .or(call.client.client_secret.as_deref())
                .ok_or(BrokerError::IncompleteCredentials {
                    auth_mode: AuthMode::Tba,
                })?;
            let realm = call
                .connection_config
                .get("accountId")
                .and_then(JsonValue::as_str)
                .map(tba_realm);

            let params = OAuth1SigningParams {
                consumer_key,
                consumer_secret,
                token_id,
                token_secret,
                method: method.as_str(),
                url,
                realm: realm.as_deref(),
            };
            let header = oauth1_auth_header(&params, &generate_nonce(), Utc::now().timestamp())?;
            sensitive_values.push(token_secret.clone());
            set_header(headers, "authorization", header);
        }
    }
    Ok(())
}

/// Resolve `${accessToken}`, `${apiKey}` and connection-config placeholders
/// in a template header or query value.
fn bind_template_value(
    value: &str,
    credentials: &Credentials,
    config: &Map<String, JsonValue>,
) -> Result<String, BrokerError> {
    let mut out = value.to_string();
    if out.contains("${accessToken}") {
        let token = match credentials {
            Credentials::Oauth2 { access_token, .. }
            | Credentials::App { access_token, .. }
            | Credentials::AppStore { access_token, .. } => access_token,
            Credentials::Oauth2Cc { token, .. } | Credentials::Tableau { token, .. } => token,
            other => {
                return Err(BrokerError::IncompleteCredentials {
                    auth_mode: other.auth_mode(),
                });
            }
        };
        out = out.replace("${accessToken}", token);
    }
    if out.contains("${apiKey}") {
        let Credentials::ApiKey { api_key, .. } = credentials else {
            return Err(BrokerError::IncompleteCredentials {
                auth_mode: credentials.auth_mode(),
            });
        };
        out = out.replace("${apiKey}", api_key);
    }
    Ok(interpolate(&out, config))
}

/// Case-insensitive upsert so later layers override earlier ones.
fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    let lower = name.to_ascii_lowercase();
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&lower)) {
        Some(existing) => existing.1 = value,
        None => headers.push((lower, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(json_str: &str) -> ProviderTemplate {
        serde_json::from_str(json_str).unwrap()
    }

    fn config(pairs: &[(&str, &str)]) -> Map<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    fn oauth2(token: &str) -> Credentials {
        Credentials::Oauth2 {
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
            raw: json!({}),
        }
    }

    fn call<'a>(
        template: &'a ProviderTemplate,
        credentials: &'a Credentials,
        config: &'a Map<String, JsonValue>,
        client: &'a ClientCredentials,
        endpoint: &'a str,
    ) -> ProxyCall<'a> {
        ProxyCall {
            method: "get",
            endpoint,
            headers: vec![],
            body: ProxyBody::Empty,
            base_url_override: None,
            template,
            credentials,
            connection_config: config,
            client,
        }
    }

    fn header<'a>(built: &'a BuiltRequest, name: &str) -> Option<&'a str> {
        built
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn joins_base_and_endpoint_with_one_slash() {
        let cfg = Map::new();
        assert_eq!(
            join_url("https://api.github.com/", "/user/repos", &cfg),
            "https://api.github.com/user/repos"
        );
        assert_eq!(
            join_url("https://api.github.com", "user/repos", &cfg),
            "https://api.github.com/user/repos"
        );
    }

    #[test]
    fn endpoint_embedding_the_base_is_not_doubled() {
        let cfg = Map::new();
        assert_eq!(
            join_url(
                "https://api.github.com",
                "https://api.github.com/user/repos",
                &cfg
            ),
            "https://api.github.com/user/repos"
        );
    }

    #[test]
    fn bearer_header_for_oauth2() {
        let tpl = template(
            r#"{ "name": "github", "auth_mode": "OAUTH2",
                 "proxy": { "base_url": "https://api.github.com" } }"#,
        );
        let creds = oauth2("tok-123");
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let built = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/user")).unwrap();

        assert_eq!(built.url, "https://api.github.com/user");
        assert_eq!(header(&built, "authorization"), Some("Bearer tok-123"));
        assert!(built.sensitive_values.contains(&"tok-123".to_string()));
    }

    #[test]
    fn api_key_query_binding() {
        let tpl = template(
            r#"{ "name": "holded", "auth_mode": "API_KEY",
                 "proxy": { "base_url": "https://api.holded.com/api",
                            "query": { "key": "${apiKey}" } } }"#,
        );
        let creds = Credentials::ApiKey {
            api_key: "secret-key".into(),
            raw: json!({}),
        };
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let built = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/invoices")).unwrap();

        assert_eq!(built.url, "https://api.holded.com/api/invoices?key=secret-key");
        assert_eq!(header(&built, "authorization"), None);
    }

    #[test]
    fn basic_auth_encodes_username_and_password() {
        let tpl = template(
            r#"{ "name": "b", "auth_mode": "BASIC",
                 "proxy": { "base_url": "https://api.example.com" } }"#,
        );
        let creds = Credentials::Basic {
            username: "user".into(),
            password: Some("pass".into()),
            raw: json!({}),
        };
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let built = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/x")).unwrap();

        // base64("user:pass")
        assert_eq!(header(&built, "authorization"), Some("Basic dXNlcjpwYXNz"));
    }

    #[test]
    fn oauth1_is_pass_through() {
        let tpl = template(
            r#"{ "name": "o1", "auth_mode": "OAUTH1",
                 "proxy": { "base_url": "https://api.example.com" } }"#,
        );
        let creds = Credentials::Oauth1 {
            oauth_token: "t".into(),
            oauth_token_secret: "s".into(),
            raw: json!({}),
        };
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let err = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/x")).unwrap_err();
        assert_eq!(err.code(), "PASS_THROUGH_ERROR");
    }

    #[test]
    fn tba_request_is_signed_with_realm() {
        let tpl = template(
            r#"{ "name": "netsuite-tba", "auth_mode": "TBA",
                 "proxy": { "base_url": "https://${connectionConfig.accountId}.suitetalk.api.netsuite.com" } }"#,
        );
        let creds = Credentials::Tba {
            token_id: "tid".into(),
            token_secret: "tsecret".into(),
            config_override: Default::default(),
            raw: json!({}),
        };
        let cfg = config(&[("accountId", "acct-1")]);
        let client = ClientCredentials {
            client_id: Some("ck".into()),
            client_secret: Some("cs".into()),
        };
        let built =
            build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/services/rest/record/v1"))
                .unwrap();

        let auth = header(&built, "authorization").unwrap();
        assert!(auth.starts_with("OAuth realm=\"ACCT_1\""));
        assert!(auth.contains("oauth_signature="));
        assert!(built.url.starts_with("https://acct-1.suitetalk.api.netsuite.com/"));
    }

    #[test]
    fn tba_without_consumer_pair_is_incomplete() {
        let tpl = template(
            r#"{ "name": "netsuite-tba", "auth_mode": "TBA",
                 "proxy": { "base_url": "https://api.example.com" } }"#,
        );
        let creds = Credentials::Tba {
            token_id: "tid".into(),
            token_secret: "ts".into(),
            config_override: Default::default(),
            raw: json!({}),
        };
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let err = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/x")).unwrap_err();
        assert_eq!(err.code(), "INCOMPLETE_RAW_CREDENTIALS");
    }

    #[test]
    fn template_headers_are_bound_and_caller_wins() {
        let tpl = template(
            r#"{ "name": "t", "auth_mode": "OAUTH2",
                 "proxy": { "base_url": "https://api.example.com",
                            "headers": { "x-api-version": "2024-01",
                                         "x-token-echo": "${accessToken}" } } }"#,
        );
        let creds = oauth2("tok");
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let mut c = call(&tpl, &creds, &cfg, &client, "/x");
        c.headers = vec![("X-Api-Version".into(), "override".into())];
        let built = build_proxy_request(&c).unwrap();

        assert_eq!(header(&built, "x-api-version"), Some("override"));
        assert_eq!(header(&built, "x-token-echo"), Some("tok"));
    }

    #[test]
    fn missing_base_url_is_an_error() {
        let tpl = template(r#"{ "name": "bare", "auth_mode": "OAUTH2" }"#);
        let creds = oauth2("tok");
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let err = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "/x")).unwrap_err();
        assert_eq!(err.code(), "MISSING_BASE_API_URL");
    }

    #[test]
    fn alternation_base_url_resolves_per_connection() {
        let tpl = template(
            r#"{ "name": "gorgias", "auth_mode": "OAUTH2",
                 "proxy": { "base_url": "https://${connectionConfig.subdomain}.gorgias.com/api||https://api.gorgias.com" } }"#,
        );
        let creds = oauth2("tok");
        let client = ClientCredentials::default();

        let with_sub = config(&[("subdomain", "acme")]);
        let built = build_proxy_request(&call(&tpl, &creds, &with_sub, &client, "/tickets")).unwrap();
        assert_eq!(built.url, "https://acme.gorgias.com/api/tickets");

        let without = Map::new();
        let built = build_proxy_request(&call(&tpl, &creds, &without, &client, "/tickets")).unwrap();
        assert_eq!(built.url, "https://api.gorgias.com/tickets");
    }

    #[test]
    fn base_url_override_beats_template() {
        let tpl = template(
            r#"{ "name": "t", "auth_mode": "OAUTH2",
                 "proxy": { "base_url": "https://api.example.com" } }"#,
        );
        let creds = oauth2("tok");
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let mut c = call(&tpl, &creds, &cfg, &client, "/x");
        c.base_url_override = Some("https://sandbox.example.com");
        let built = build_proxy_request(&c).unwrap();
        assert_eq!(built.url, "https://sandbox.example.com/x");
    }

    #[test]
    fn multipart_body_discards_caller_content_type() {
        let tpl = template(
            r#"{ "name": "t", "auth_mode": "OAUTH2",
                 "proxy": { "base_url": "https://api.example.com" } }"#,
        );
        let creds = oauth2("tok");
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let mut c = call(&tpl, &creds, &cfg, &client, "/upload");
        c.method = "post";
        c.headers = vec![(
            "content-type".into(),
            "multipart/form-data; boundary=deadbeef".into(),
        )];
        c.body = ProxyBody::Multipart {
            fields: vec![("purpose".into(), "import".into())],
            files: vec![FilePart {
                field: "file".into(),
                file_name: Some("data.csv".into()),
                content_type: Some("text/csv".into()),
                bytes: b"a,b\n1,2\n".to_vec(),
            }],
        };
        let built = build_proxy_request(&c).unwrap();

        // The executor sets a fresh boundary when serializing the form.
        assert_eq!(header(&built, "content-type"), None);
        let ProxyBody::Multipart { fields, files } = &built.body else {
            panic!("expected a multipart body");
        };
        assert_eq!(fields[0], ("purpose".into(), "import".into()));
        assert_eq!(files[0].file_name.as_deref(), Some("data.csv"));
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let tpl = template(
            r#"{ "name": "t", "auth_mode": "OAUTH2",
                 "proxy": { "base_url": "https://api.example.com" } }"#,
        );
        let creds = oauth2("tok");
        let cfg = Map::new();
        let client = ClientCredentials::default();
        let err = build_proxy_request(&call(&tpl, &creds, &cfg, &client, "  ")).unwrap_err();
        assert_eq!(err.code(), "MISSING_ENDPOINT");
    }
}
