//! Provider template catalog
//!
//! Templates describe how to talk to each upstream API: where its token
//! endpoint lives, how the proxy should address it, and the quirks of its
//! token responses. The built-in catalog ships as JSON and can be replaced
//! or extended from a file at startup.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::credentials::AuthMode;
use crate::error::BrokerError;

/// Unit of the `expires_in` field in a provider's token response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiresInUnit {
    #[default]
    Seconds,
    Milliseconds,
}

/// How a client-credentials token request is serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenBodyFormat {
    #[default]
    Form,
    Json,
}

/// Where client id/secret go on a client-credentials token request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenAuthMethod {
    /// Credentials in the request body.
    #[default]
    Body,
    /// HTTP Basic authorization header.
    Basic,
}

fn default_true() -> bool {
    true
}

/// Token-response quirks for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    #[serde(default)]
    pub expires_in_unit: ExpiresInUnit,
    /// Whether a refresh-token grant must carry a `refresh_token` parameter.
    /// A few providers re-issue from the access token alone.
    #[serde(default = "default_true")]
    pub refresh_requires_refresh_token: bool,
    #[serde(default)]
    pub token_body_format: TokenBodyFormat,
    #[serde(default)]
    pub token_auth_method: TokenAuthMethod,
    /// Per-provider override of the staleness buffer before expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiration_buffer_seconds: Option<u64>,
    /// Whether freshness is decided by introspecting the token upstream
    /// rather than by a stored expiry.
    #[serde(default)]
    pub introspection: bool,
}

impl Default for ProviderMetadata {
    fn default() -> Self {
        Self {
            expires_in_unit: ExpiresInUnit::Seconds,
            refresh_requires_refresh_token: true,
            token_body_format: TokenBodyFormat::Form,
            token_auth_method: TokenAuthMethod::Body,
            token_expiration_buffer_seconds: None,
            introspection: false,
        }
    }
}

/// Names of response headers a provider uses to signal rate-limit waits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryHeaderHints {
    /// Header carrying an absolute epoch timestamp to resume at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    /// Header carrying a relative wait in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// How the proxy addresses a provider's API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyTemplate {
    /// Base URL; may contain `${connectionConfig.x}` placeholders and a
    /// `${a||b}` alternation between two candidate bases.
    #[serde(default)]
    pub base_url: String,
    /// Headers to add to every proxied request. Values may reference
    /// `${accessToken}` or `${connectionConfig.x}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters to add, typically `${apiKey}` bindings.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryHeaderHints,
}

/// Everything the broker knows about one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTemplate {
    pub name: String,
    pub auth_mode: AuthMode,
    /// Endpoint that issues tokens (client-credentials, app JWT exchange,
    /// Tableau signin). May contain `${connectionConfig.x}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    /// Endpoint for refresh-token grants when it differs from `token_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,
    /// Extra parameters sent on every token request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyTemplate>,
    #[serde(default)]
    pub metadata: ProviderMetadata,
}

impl ProviderTemplate {
    /// Token-refresh endpoint, preferring the dedicated refresh URL.
    pub fn refresh_endpoint(&self) -> Option<&str> {
        self.refresh_url.as_deref().or(self.token_url.as_deref())
    }
}

/// Catalog of provider templates keyed by provider name.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    templates: HashMap<String, ProviderTemplate>,
}

impl ProviderCatalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Self {
        // The embedded catalog is validated by tests, so a parse failure
        // here cannot occur at runtime.
        Self::from_json_str(include_str!("../catalog/providers.json"))
            .unwrap_or_else(|_| Self::default())
    }

    pub fn from_json_str(json: &str) -> Result<Self, BrokerError> {
        let templates: Vec<ProviderTemplate> = serde_json::from_str(json)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid provider catalog: {e}")))?;
        Ok(Self {
            templates: templates.into_iter().map(|t| (t.name.clone(), t)).collect(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BrokerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Internal(anyhow::anyhow!(
                "cannot read provider catalog {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&json)
    }

    pub fn get(&self, provider: &str) -> Result<&ProviderTemplate, BrokerError> {
        self.templates
            .get(provider)
            .ok_or_else(|| BrokerError::UnknownProviderTemplate(provider.to_string()))
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.templates.contains_key(provider)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Register or replace a template.
    pub fn upsert(&mut self, template: ProviderTemplate) {
        self.templates.insert(template.name.clone(), template);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = ProviderCatalog::builtin();
        assert!(!catalog.is_empty());
        let github = catalog.get("github").unwrap();
        assert_eq!(github.auth_mode, AuthMode::Oauth2);
        assert!(github.proxy.as_ref().is_some_and(|p| !p.base_url.is_empty()));
    }

    #[test]
    fn catalog_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"[{ "name": "acme", "auth_mode": "API_KEY",
                  "proxy": { "base_url": "https://api.acme.test" } }]"#,
        )
        .unwrap();
        let catalog = ProviderCatalog::from_file(&path).unwrap();
        assert!(catalog.contains("acme"));
        assert!(ProviderCatalog::from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let catalog = ProviderCatalog::builtin();
        let err = catalog.get("no-such-provider").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownProviderTemplate(_)));
    }

    #[test]
    fn facebook_refresh_does_not_require_refresh_token() {
        let catalog = ProviderCatalog::builtin();
        let facebook = catalog.get("facebook").unwrap();
        assert!(!facebook.metadata.refresh_requires_refresh_token);
        let github = catalog.get("github").unwrap();
        assert!(github.metadata.refresh_requires_refresh_token);
    }

    #[test]
    fn metadata_defaults() {
        let template: ProviderTemplate = serde_json::from_str(
            r#"{ "name": "minimal", "auth_mode": "API_KEY" }"#,
        )
        .unwrap();
        assert!(template.metadata.refresh_requires_refresh_token);
        assert_eq!(template.metadata.expires_in_unit, ExpiresInUnit::Seconds);
        assert!(template.proxy.is_none());
    }

    #[test]
    fn refresh_endpoint_prefers_refresh_url() {
        let mut template: ProviderTemplate = serde_json::from_str(
            r#"{ "name": "t", "auth_mode": "OAUTH2", "token_url": "https://a/token" }"#,
        )
        .unwrap();
        assert_eq!(template.refresh_endpoint(), Some("https://a/token"));
        template.refresh_url = Some("https://a/refresh".into());
        assert_eq!(template.refresh_endpoint(), Some("https://a/refresh"));
    }
}
