//! Upstream token re-issuance
//!
//! One strategy per refreshable credential family, all returning the same
//! variant family they consumed:
//!
//! - OAUTH2: refresh-token grant against the provider's token endpoint.
//! - OAUTH2_CC: client-credentials re-issuance honoring the provider's body
//!   format and auth method quirks.
//! - APP: RS256 app JWT exchanged for an installation token.
//! - APP_STORE: ES256 JWT minted locally from the stored private key; no
//!   upstream call is involved.
//! - TABLEAU: personal-access-token sign-in returning a fresh site token.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::catalog::{ProviderTemplate, TokenAuthMethod, TokenBodyFormat};
use crate::credentials::{AuthMode, Credentials, parse_raw_credentials};
use crate::error::{BrokerError, body_snippet};
use crate::template::interpolate;

const APP_JWT_TTL_SECS: i64 = 10 * 60;
const APP_STORE_JWT_TTL_SECS: i64 = 15 * 60;

/// OAuth client material resolved from the provider config row.
#[derive(Debug, Default, Clone)]
pub struct ClientCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Executes token-endpoint requests for the refresh coordinator.
pub struct TokenExchanger {
    http: reqwest::Client,
}

impl TokenExchanger {
    pub fn new(request_timeout: Duration) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("http client build: {e}")))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Re-issue credentials for a refreshable family.
    pub async fn renew(
        &self,
        template: &ProviderTemplate,
        client: &ClientCredentials,
        custom: &Map<String, JsonValue>,
        connection_config: &Map<String, JsonValue>,
        current: &Credentials,
    ) -> Result<Credentials, BrokerError> {
        match current {
            Credentials::Oauth2 { refresh_token, .. } => {
                self.refresh_oauth2(template, client, connection_config, refresh_token.as_deref())
                    .await
            }
            Credentials::Oauth2Cc {
                client_id,
                client_secret,
                ..
            } => {
                // Stored per-connection client credentials win over the
                // provider config defaults.
                let effective = ClientCredentials {
                    client_id: non_empty(client_id).or_else(|| client.client_id.clone()),
                    client_secret: non_empty(client_secret)
                        .or_else(|| client.client_secret.clone()),
                };
                self.client_credentials(template, &effective, connection_config)
                    .await
            }
            Credentials::App { .. } => {
                self.app_token(template, custom, connection_config).await
            }
            Credentials::AppStore {
                private_key_b64, ..
            } => app_store_token(private_key_b64, connection_config),
            Credentials::Tableau {
                pat_name,
                pat_secret,
                content_url,
                ..
            } => {
                self.tableau_token(template, connection_config, pat_name, pat_secret, content_url)
                    .await
            }
            other => Err(BrokerError::Internal(anyhow::anyhow!(
                "credential family {} is not refreshable",
                other.auth_mode()
            ))),
        }
    }

    async fn refresh_oauth2(
        &self,
        template: &ProviderTemplate,
        client: &ClientCredentials,
        connection_config: &Map<String, JsonValue>,
        refresh_token: Option<&str>,
    ) -> Result<Credentials, BrokerError> {
        let endpoint = token_endpoint(template, connection_config, true)?;

        let mut form: Vec<(String, String)> = vec![(
            "grant_type".to_string(),
            "refresh_token".to_string(),
        )];
        if let Some(refresh_token) = refresh_token {
            form.push(("refresh_token".to_string(), refresh_token.to_string()));
        }
        if let Some(client_id) = &client.client_id {
            form.push(("client_id".to_string(), client_id.clone()));
        }
        if let Some(client_secret) = &client.client_secret {
            form.push(("client_secret".to_string(), client_secret.clone()));
        }
        for (key, value) in &template.token_params {
            form.push((key.clone(), value.clone()));
        }

        let response = self
            .http
            .post(&endpoint)
            .header("accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(BrokerError::RefreshTokenExternal {
                message: body_snippet(&body),
            });
        }

        let raw: JsonValue = parse_token_body(&body)?;
        let parsed = parse_raw_credentials(&raw, AuthMode::Oauth2, Some(&template.metadata))?;

        // Some providers omit the refresh token in refresh responses; keep
        // the one we already hold.
        match parsed {
            Credentials::Oauth2 {
                access_token,
                refresh_token: new_refresh,
                expires_at,
                raw,
            } => Ok(Credentials::Oauth2 {
                access_token,
                refresh_token: new_refresh.or_else(|| refresh_token.map(str::to_string)),
                expires_at,
                raw,
            }),
            other => Ok(other),
        }
    }

    async fn client_credentials(
        &self,
        template: &ProviderTemplate,
        client: &ClientCredentials,
        connection_config: &Map<String, JsonValue>,
    ) -> Result<Credentials, BrokerError> {
        let endpoint = token_endpoint(template, connection_config, false)?;
        let (client_id, client_secret) = match (&client.client_id, &client.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => {
                return Err(BrokerError::InvalidClientCredentials {
                    message: "client id and secret are required".to_string(),
                });
            }
        };

        let mut params: Map<String, JsonValue> = Map::new();
        params.insert("grant_type".into(), "client_credentials".into());
        for (key, value) in &template.token_params {
            params.insert(key.clone(), JsonValue::String(value.clone()));
        }
        if let Some(scope) = connection_config
            .get("oauth_scopes")
            .or_else(|| connection_config.get("scope"))
            .and_then(JsonValue::as_str)
        {
            params.insert("scope".into(), JsonValue::String(scope.to_string()));
        }

        let mut request = self
            .http
            .post(&endpoint)
            .header("accept", "application/json");
        match template.metadata.token_auth_method {
            TokenAuthMethod::Basic => {
                request = request.basic_auth(&client_id, Some(&client_secret));
            }
            TokenAuthMethod::Body => {
                params.insert("client_id".into(), JsonValue::String(client_id.clone()));
                params.insert(
                    "client_secret".into(),
                    JsonValue::String(client_secret.clone()),
                );
            }
        }
        request = match template.metadata.token_body_format {
            TokenBodyFormat::Json => request.json(&params),
            TokenBodyFormat::Form => {
                let form: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| {
                        let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        (k.clone(), value)
                    })
                    .collect();
                request.form(&form)
            }
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(BrokerError::InvalidClientCredentials {
                message: body_snippet(&body),
            });
        }

        let raw: JsonValue = parse_token_body(&body)?;
        let parsed = parse_raw_credentials(&raw, AuthMode::Oauth2Cc, Some(&template.metadata))?;
        match parsed {
            Credentials::Oauth2Cc {
                token, expires_at, raw, ..
            } => Ok(Credentials::Oauth2Cc {
                token,
                client_id,
                client_secret,
                expires_at,
                raw,
            }),
            other => Ok(other),
        }
    }

    async fn app_token(
        &self,
        template: &ProviderTemplate,
        custom: &Map<String, JsonValue>,
        connection_config: &Map<String, JsonValue>,
    ) -> Result<Credentials, BrokerError> {
        let endpoint = token_endpoint(template, connection_config, false)?;
        let app_id = custom
            .get("app_id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                BrokerError::Internal(anyhow::anyhow!("provider config is missing app_id"))
            })?;
        let private_key = custom
            .get("private_key")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                BrokerError::Internal(anyhow::anyhow!("provider config is missing private_key"))
            })?
            .replace("\\n", "\n");

        #[derive(Serialize)]
        struct AppClaims<'a> {
            iat: i64,
            exp: i64,
            iss: &'a str,
        }

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // Backdated to tolerate clock skew against the provider.
            iat: now - 60,
            exp: now + APP_JWT_TTL_SECS,
            iss: app_id,
        };
        let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid app private key: {e}")))?;
        let jwt = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("app jwt signing: {e}")))?;

        let response = self
            .http
            .post(&endpoint)
            .header("accept", "application/vnd.github.v3+json")
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(BrokerError::RefreshTokenExternal {
                message: body_snippet(&body),
            });
        }

        let raw: JsonValue = parse_token_body(&body)?;
        parse_raw_credentials(&raw, AuthMode::App, Some(&template.metadata))
    }

    async fn tableau_token(
        &self,
        template: &ProviderTemplate,
        connection_config: &Map<String, JsonValue>,
        pat_name: &str,
        pat_secret: &str,
        content_url: &str,
    ) -> Result<Credentials, BrokerError> {
        let endpoint = token_endpoint(template, connection_config, false)?;

        let body = serde_json::json!({
            "credentials": {
                "personalAccessTokenName": pat_name,
                "personalAccessTokenSecret": pat_secret,
                "site": { "contentUrl": content_url },
            }
        });

        let response = self
            .http
            .post(&endpoint)
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(BrokerError::InvalidTableauCredentials {
                message: body_snippet(&body),
            });
        }

        let raw: JsonValue = parse_token_body(&body)?;
        let parsed = parse_raw_credentials(&raw, AuthMode::Tableau, Some(&template.metadata))?;
        match parsed {
            Credentials::Tableau {
                token, expires_at, raw, ..
            } => Ok(Credentials::Tableau {
                token,
                pat_name: pat_name.to_string(),
                pat_secret: pat_secret.to_string(),
                content_url: content_url.to_string(),
                expires_at,
                raw,
            }),
            other => Ok(other),
        }
    }
}

/// Mint a fresh App Store Connect JWT from the stored private key. Apple
/// accepts the signed JWT directly, so no exchange request is made.
fn app_store_token(
    private_key_b64: &str,
    connection_config: &Map<String, JsonValue>,
) -> Result<Credentials, BrokerError> {
    use base64::{Engine as _, engine::general_purpose};

    let issuer_id = connection_config
        .get("issuerId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            BrokerError::Internal(anyhow::anyhow!("connection config is missing issuerId"))
        })?;
    let key_id = connection_config
        .get("privateKeyId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            BrokerError::Internal(anyhow::anyhow!("connection config is missing privateKeyId"))
        })?;

    let pem = general_purpose::STANDARD
        .decode(private_key_b64)
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid private key base64: {e}")))?;

    #[derive(Serialize)]
    struct AppStoreClaims<'a> {
        iss: &'a str,
        iat: i64,
        exp: i64,
        aud: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<Vec<String>>,
    }

    let now = Utc::now().timestamp();
    let expires_at = now + APP_STORE_JWT_TTL_SECS;
    let scope = connection_config.get("scope").and_then(|v| {
        v.as_array().map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
    });
    let claims = AppStoreClaims {
        iss: issuer_id,
        iat: now,
        exp: expires_at,
        aud: "appstoreconnect-v1",
        scope,
    };

    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(key_id.to_string());
    let key = EncodingKey::from_ec_pem(&pem)
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid app store key: {e}")))?;
    let jwt = encode(&header, &claims, &key)
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("app store jwt signing: {e}")))?;

    Ok(Credentials::AppStore {
        access_token: jwt,
        private_key_b64: private_key_b64.to_string(),
        expires_at: chrono::DateTime::from_timestamp(expires_at, 0)
            .unwrap_or_else(Utc::now),
        raw: serde_json::json!({}),
    })
}

fn token_endpoint(
    template: &ProviderTemplate,
    connection_config: &Map<String, JsonValue>,
    prefer_refresh_url: bool,
) -> Result<String, BrokerError> {
    let endpoint = if prefer_refresh_url {
        template.refresh_endpoint()
    } else {
        template.token_url.as_deref()
    }
    .ok_or_else(|| {
        BrokerError::Internal(anyhow::anyhow!(
            "provider '{}' has no token endpoint",
            template.name
        ))
    })?;
    Ok(interpolate(endpoint, connection_config))
}

fn parse_token_body(body: &str) -> Result<JsonValue, BrokerError> {
    serde_json::from_str(body).map_err(|_| BrokerError::RefreshTokenExternal {
        message: "token endpoint returned a non-JSON body".to_string(),
    })
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    BrokerError::Transport {
        attempts: 1,
        message: e.to_string(),
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn non_refreshable_families_are_rejected() {
        let exchanger = TokenExchanger::with_client(reqwest::Client::new());
        let template: ProviderTemplate =
            serde_json::from_str(r#"{ "name": "t", "auth_mode": "API_KEY" }"#).unwrap();
        let creds = Credentials::ApiKey {
            api_key: "k".into(),
            raw: json!({}),
        };
        let result = exchanger
            .renew(
                &template,
                &ClientCredentials::default(),
                &Map::new(),
                &Map::new(),
                &creds,
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn token_endpoint_interpolates_connection_config() {
        let template: ProviderTemplate = serde_json::from_str(
            r#"{
                "name": "tableau",
                "auth_mode": "TABLEAU",
                "token_url": "https://${connectionConfig.siteUrl}/api/3.22/auth/signin"
            }"#,
        )
        .unwrap();
        let mut config = Map::new();
        config.insert("siteUrl".into(), json!("eu-west-1a.online.tableau.com"));
        let endpoint = token_endpoint(&template, &config, false).unwrap();
        assert_eq!(
            endpoint,
            "https://eu-west-1a.online.tableau.com/api/3.22/auth/signin"
        );
    }

    #[test]
    fn missing_client_credentials_is_a_distinct_error() {
        let err = BrokerError::InvalidClientCredentials {
            message: "client id and secret are required".into(),
        };
        assert_eq!(err.code(), "INVALID_CLIENT_CREDENTIALS");
    }
}
