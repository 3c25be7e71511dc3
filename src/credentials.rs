//! Typed credential model
//!
//! Every supported auth mode is a variant of [`Credentials`], tagged by
//! `type` so stored payloads stay compatible across refreshes. Parsing of
//! upstream token-endpoint responses and expiry decisions live here; no I/O.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::catalog::{ExpiresInUnit, ProviderMetadata};
use crate::error::BrokerError;

/// Default lifetime assigned to tokens that look non-expiring but must still
/// be periodically re-issued (55 minutes).
const DEFAULT_EXPIRES_IN_SECS: i64 = 55 * 60;

/// Default freshness buffer before expiry (15 minutes).
pub const DEFAULT_EXPIRATION_BUFFER_SECS: i64 = 15 * 60;

/// Auth protocol family a provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    Oauth1,
    Oauth2,
    Oauth2Cc,
    ApiKey,
    Basic,
    App,
    AppStore,
    Tba,
    Tableau,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Oauth1 => "OAUTH1",
            AuthMode::Oauth2 => "OAUTH2",
            AuthMode::Oauth2Cc => "OAUTH2_CC",
            AuthMode::ApiKey => "API_KEY",
            AuthMode::Basic => "BASIC",
            AuthMode::App => "APP",
            AuthMode::AppStore => "APP_STORE",
            AuthMode::Tba => "TBA",
            AuthMode::Tableau => "TABLEAU",
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional client id/secret override stored alongside TBA credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TbaConfigOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Closed sum over every supported credential shape.
///
/// The `raw` field keeps the verbatim provider response for debugging; it is
/// stored encrypted with the rest of the credential and never logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "OAUTH1")]
    Oauth1 {
        oauth_token: String,
        oauth_token_secret: String,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "OAUTH2")]
    Oauth2 {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "OAUTH2_CC")]
    Oauth2Cc {
        token: String,
        client_id: String,
        client_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "API_KEY")]
    ApiKey {
        api_key: String,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "BASIC")]
    Basic {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "APP")]
    App {
        access_token: String,
        expires_at: DateTime<Utc>,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "APP_STORE")]
    AppStore {
        access_token: String,
        private_key_b64: String,
        expires_at: DateTime<Utc>,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "TBA")]
    Tba {
        token_id: String,
        token_secret: String,
        #[serde(default)]
        config_override: TbaConfigOverride,
        #[serde(default)]
        raw: JsonValue,
    },
    #[serde(rename = "TABLEAU")]
    Tableau {
        token: String,
        pat_name: String,
        pat_secret: String,
        content_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        raw: JsonValue,
    },
}

impl Credentials {
    /// The auth mode family this credential belongs to. Refresh must always
    /// produce the same family it consumed.
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Credentials::Oauth1 { .. } => AuthMode::Oauth1,
            Credentials::Oauth2 { .. } => AuthMode::Oauth2,
            Credentials::Oauth2Cc { .. } => AuthMode::Oauth2Cc,
            Credentials::ApiKey { .. } => AuthMode::ApiKey,
            Credentials::Basic { .. } => AuthMode::Basic,
            Credentials::App { .. } => AuthMode::App,
            Credentials::AppStore { .. } => AuthMode::AppStore,
            Credentials::Tba { .. } => AuthMode::Tba,
            Credentials::Tableau { .. } => AuthMode::Tableau,
        }
    }

    /// Whether this credential family can be re-issued by the broker at all.
    pub fn is_refreshable(&self) -> bool {
        match self {
            Credentials::Oauth2 { .. }
            | Credentials::Oauth2Cc { .. }
            | Credentials::App { .. }
            | Credentials::AppStore { .. }
            | Credentials::Tableau { .. } => true,
            Credentials::Oauth1 { .. }
            | Credentials::ApiKey { .. }
            | Credentials::Basic { .. }
            | Credentials::Tba { .. } => false,
        }
    }

    /// Expiry timestamp, when the variant tracks one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credentials::Oauth2 { expires_at, .. }
            | Credentials::Oauth2Cc { expires_at, .. }
            | Credentials::Tableau { expires_at, .. } => *expires_at,
            Credentials::App { expires_at, .. } | Credentials::AppStore { expires_at, .. } => {
                Some(*expires_at)
            }
            Credentials::Oauth1 { .. }
            | Credentials::ApiKey { .. }
            | Credentials::Basic { .. }
            | Credentials::Tba { .. } => None,
        }
    }
}

/// True when `now + buffer` has reached the expiration timestamp.
pub fn is_token_expired(expires_at: DateTime<Utc>, buffer_seconds: i64) -> bool {
    Utc::now() + Duration::seconds(buffer_seconds) >= expires_at
}

/// Parse an absolute expiration value: epoch seconds or an RFC 3339 string.
pub fn parse_expiration_date(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            let secs = n.as_i64()?;
            DateTime::from_timestamp(secs, 0)
        }
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        _ => None,
    }
}

/// Parse Tableau's `estimatedTimeToExpiration` countdown, a
/// `days:hours:minutes`-style string relative to now.
pub fn parse_tableau_expiration(value: &str) -> Option<DateTime<Utc>> {
    let mut parts = value.split(':');
    let days: i64 = parts.next()?.parse().ok()?;
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    Some(Utc::now() + Duration::days(days) + Duration::hours(hours) + Duration::minutes(minutes))
}

fn expires_in_to_deadline(raw: &JsonValue, unit: ExpiresInUnit) -> Option<DateTime<Utc>> {
    let expires_in = match raw {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }?;
    let duration = match unit {
        ExpiresInUnit::Seconds => Duration::seconds(expires_in),
        ExpiresInUnit::Milliseconds => Duration::milliseconds(expires_in),
    };
    Some(Utc::now() + duration)
}

fn str_field<'a>(raw: &'a JsonValue, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(JsonValue::as_str)
}

/// Parse an arbitrary token-endpoint response into a typed credential.
///
/// `hints` supplies provider quirks such as the `expires_in` unit. Fails with
/// [`BrokerError::IncompleteCredentials`] when required fields are absent.
pub fn parse_raw_credentials(
    raw: &JsonValue,
    auth_mode: AuthMode,
    hints: Option<&ProviderMetadata>,
) -> Result<Credentials, BrokerError> {
    let incomplete = || BrokerError::IncompleteCredentials { auth_mode };

    match auth_mode {
        AuthMode::Oauth2 => {
            let access_token = str_field(raw, "access_token").ok_or_else(incomplete)?;

            let expires_at = if let Some(absolute) = raw.get("expires_at") {
                parse_expiration_date(absolute)
            } else if let Some(relative) = raw.get("expires_in") {
                expires_in_to_deadline(relative, ExpiresInUnit::Seconds)
            } else {
                None
            };

            Ok(Credentials::Oauth2 {
                access_token: access_token.to_string(),
                refresh_token: str_field(raw, "refresh_token").map(str::to_string),
                expires_at,
                raw: raw.clone(),
            })
        }
        AuthMode::Oauth1 => {
            let oauth_token = str_field(raw, "oauth_token").ok_or_else(incomplete)?;
            let oauth_token_secret = str_field(raw, "oauth_token_secret").ok_or_else(incomplete)?;

            Ok(Credentials::Oauth1 {
                oauth_token: oauth_token.to_string(),
                oauth_token_secret: oauth_token_secret.to_string(),
                raw: raw.clone(),
            })
        }
        AuthMode::Oauth2Cc => {
            // Providers disagree on where the token lives.
            let token = str_field(raw, "access_token")
                .or_else(|| raw.pointer("/data/token").and_then(JsonValue::as_str))
                .or_else(|| str_field(raw, "jwt"))
                .ok_or_else(incomplete)?;

            let expires_at = if let Some(absolute) = raw.get("expires_at") {
                parse_expiration_date(absolute)
            } else if let Some(relative) = raw.get("expires_in") {
                let unit = hints.map(|h| h.expires_in_unit).unwrap_or_default();
                expires_in_to_deadline(relative, unit)
            } else {
                Some(Utc::now() + Duration::seconds(DEFAULT_EXPIRES_IN_SECS))
            };

            Ok(Credentials::Oauth2Cc {
                token: token.to_string(),
                client_id: String::new(),
                client_secret: String::new(),
                expires_at,
                raw: raw.clone(),
            })
        }
        AuthMode::Tableau => {
            let token = raw
                .pointer("/credentials/token")
                .and_then(JsonValue::as_str)
                .ok_or_else(incomplete)?;

            let expires_at = raw
                .pointer("/credentials/estimatedTimeToExpiration")
                .and_then(JsonValue::as_str)
                .and_then(parse_tableau_expiration);

            Ok(Credentials::Tableau {
                token: token.to_string(),
                pat_name: String::new(),
                pat_secret: String::new(),
                content_url: String::new(),
                expires_at,
                raw: raw.clone(),
            })
        }
        AuthMode::App | AuthMode::AppStore => {
            let access_token = str_field(raw, "token").ok_or_else(incomplete)?;
            let expires_at = raw
                .get("expires_at")
                .and_then(parse_expiration_date)
                .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_EXPIRES_IN_SECS));

            match auth_mode {
                AuthMode::App => Ok(Credentials::App {
                    access_token: access_token.to_string(),
                    expires_at,
                    raw: raw.clone(),
                }),
                _ => Ok(Credentials::AppStore {
                    access_token: access_token.to_string(),
                    private_key_b64: String::new(),
                    expires_at,
                    raw: raw.clone(),
                }),
            }
        }
        AuthMode::ApiKey | AuthMode::Basic | AuthMode::Tba => Err(incomplete()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oauth2_requires_access_token() {
        let raw = json!({ "refresh_token": "r" });
        let err = parse_raw_credentials(&raw, AuthMode::Oauth2, None).unwrap_err();
        assert!(matches!(err, BrokerError::IncompleteCredentials { .. }));
    }

    #[test]
    fn oauth2_expires_in_seconds() {
        let raw = json!({ "access_token": "a", "refresh_token": "r", "expires_in": 3600 });
        let creds = parse_raw_credentials(&raw, AuthMode::Oauth2, None).unwrap();
        let Credentials::Oauth2 {
            expires_at: Some(expires_at),
            refresh_token,
            ..
        } = creds
        else {
            panic!("expected OAUTH2 with expiry");
        };
        assert_eq!(refresh_token.as_deref(), Some("r"));
        let delta = (expires_at - Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&delta), "delta was {delta}");
    }

    #[test]
    fn oauth2_absolute_epoch_expiry() {
        let raw = json!({ "access_token": "a", "expires_at": 2_000_000_000 });
        let creds = parse_raw_credentials(&raw, AuthMode::Oauth2, None).unwrap();
        assert_eq!(
            creds.expires_at(),
            DateTime::from_timestamp(2_000_000_000, 0)
        );
    }

    #[test]
    fn oauth1_requires_both_token_parts() {
        let raw = json!({ "oauth_token": "t" });
        assert!(parse_raw_credentials(&raw, AuthMode::Oauth1, None).is_err());

        let raw = json!({ "oauth_token": "t", "oauth_token_secret": "s" });
        let creds = parse_raw_credentials(&raw, AuthMode::Oauth1, None).unwrap();
        assert_eq!(creds.auth_mode(), AuthMode::Oauth1);
    }

    #[test]
    fn client_credentials_accepts_nested_token_and_defaults_expiry() {
        let raw = json!({ "data": { "token": "nested" } });
        let creds = parse_raw_credentials(&raw, AuthMode::Oauth2Cc, None).unwrap();
        let Credentials::Oauth2Cc {
            token,
            expires_at: Some(expires_at),
            ..
        } = creds
        else {
            panic!("expected OAUTH2_CC with default expiry");
        };
        assert_eq!(token, "nested");
        let delta = (expires_at - Utc::now()).num_seconds();
        assert!((DEFAULT_EXPIRES_IN_SECS - 10..=DEFAULT_EXPIRES_IN_SECS).contains(&delta));
    }

    #[test]
    fn client_credentials_millisecond_unit_from_hints() {
        let raw = json!({ "access_token": "a", "expires_in": 3_600_000 });
        let hints = ProviderMetadata {
            expires_in_unit: ExpiresInUnit::Milliseconds,
            ..ProviderMetadata::default()
        };
        let creds = parse_raw_credentials(&raw, AuthMode::Oauth2Cc, Some(&hints)).unwrap();
        let delta = (creds.expires_at().unwrap() - Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&delta), "delta was {delta}");
    }

    #[test]
    fn tableau_countdown_expiry() {
        let raw = json!({
            "credentials": { "token": "pat", "estimatedTimeToExpiration": "1:02:30" }
        });
        let creds = parse_raw_credentials(&raw, AuthMode::Tableau, None).unwrap();
        let expires_at = creds.expires_at().unwrap();
        let delta = (expires_at - Utc::now()).num_minutes();
        // 1 day, 2 hours, 30 minutes
        assert!((1589..=1590).contains(&delta), "delta was {delta}");
    }

    #[test]
    fn expiry_buffer_predicate() {
        let in_twenty = Utc::now() + Duration::minutes(20);
        let in_five = Utc::now() + Duration::minutes(5);
        assert!(!is_token_expired(in_twenty, DEFAULT_EXPIRATION_BUFFER_SECS));
        assert!(is_token_expired(in_five, DEFAULT_EXPIRATION_BUFFER_SECS));
    }

    #[test]
    fn credentials_serde_tag_roundtrip() {
        let creds = Credentials::Tba {
            token_id: "id".into(),
            token_secret: "secret".into(),
            config_override: TbaConfigOverride {
                client_id: Some("ck".into()),
                client_secret: None,
            },
            raw: json!({}),
        };
        let value = serde_json::to_value(&creds).unwrap();
        assert_eq!(value["type"], "TBA");
        let back: Credentials = serde_json::from_value(value).unwrap();
        assert_eq!(back, creds);
    }

    #[test]
    fn refreshable_families() {
        let api_key = Credentials::ApiKey {
            api_key: "k".into(),
            raw: json!({}),
        };
        assert!(!api_key.is_refreshable());
        let oauth2 = Credentials::Oauth2 {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: None,
            raw: json!({}),
        };
        assert!(oauth2.is_refreshable());
    }
}
