//! OAuth1-style request signing (HMAC-SHA256)
//!
//! Used for token-based authentication against providers that expect an
//! OAuth1 `Authorization` header, notably NetSuite TBA. Nonce and timestamp
//! are injected by the caller so signatures are deterministic under test.

use base64::{Engine as _, engine::general_purpose};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use url::Url;

use crate::error::BrokerError;

type HmacSha256 = Hmac<Sha256>;

/// Inputs to an OAuth1 signature.
pub struct OAuth1SigningParams<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
    pub token_id: &'a str,
    pub token_secret: &'a str,
    /// HTTP method, any case.
    pub method: &'a str,
    /// Full request URL including the query string.
    pub url: &'a str,
    /// Optional realm spliced into the header.
    pub realm: Option<&'a str>,
}

/// RFC 3986 percent-encoding as OAuth1 requires.
fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Random alphanumeric nonce.
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            CHARS[rng.gen_range(0..CHARS.len())] as char
        })
        .collect()
}

/// NetSuite realm: account ID upper-cased with dashes replaced by
/// underscores ("acct-123" becomes "ACCT_123").
pub fn tba_realm(account_id: &str) -> String {
    account_id.replace('-', "_").to_uppercase()
}

/// Build a signed OAuth1 `Authorization` header value.
pub fn oauth1_auth_header(
    params: &OAuth1SigningParams<'_>,
    nonce: &str,
    timestamp: i64,
) -> Result<String, BrokerError> {
    let url = Url::parse(params.url)
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("cannot sign invalid url: {e}")))?;

    let mut base_url = format!(
        "{}://{}",
        url.scheme(),
        url.host_str()
            .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("cannot sign url without host")))?
    );
    if let Some(port) = url.port() {
        base_url.push_str(&format!(":{port}"));
    }
    base_url.push_str(url.path());

    let timestamp = timestamp.to_string();
    let mut pairs: Vec<(String, String)> = vec![
        ("oauth_consumer_key".into(), params.consumer_key.into()),
        ("oauth_nonce".into(), nonce.into()),
        ("oauth_signature_method".into(), "HMAC-SHA256".into()),
        ("oauth_timestamp".into(), timestamp.clone()),
        ("oauth_token".into(), params.token_id.into()),
        ("oauth_version".into(), "1.0".into()),
    ];
    for (key, value) in url.query_pairs() {
        pairs.push((key.into_owned(), value.into_owned()));
    }

    // Encode first, then sort by encoded key and value.
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();
    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "{}&{}&{}",
        params.method.to_uppercase(),
        encode(&base_url),
        encode(&param_string)
    );
    let signing_key = format!(
        "{}&{}",
        encode(params.consumer_secret),
        encode(params.token_secret)
    );

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("hmac init: {e}")))?;
    mac.update(base_string.as_bytes());
    let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    let mut header = String::from("OAuth ");
    if let Some(realm) = params.realm {
        header.push_str(&format!("realm=\"{realm}\", "));
    }
    header.push_str(&format!(
        "oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_nonce=\"{}\", \
         oauth_timestamp=\"{}\", oauth_signature_method=\"HMAC-SHA256\", \
         oauth_version=\"1.0\", oauth_signature=\"{}\"",
        encode(params.consumer_key),
        encode(params.token_id),
        encode(nonce),
        timestamp,
        encode(&signature)
    ));

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params<'a>(url: &'a str, realm: Option<&'a str>) -> OAuth1SigningParams<'a> {
        OAuth1SigningParams {
            consumer_key: "consumer-key",
            consumer_secret: "consumer-secret",
            token_id: "token-id",
            token_secret: "token-secret",
            method: "post",
            url,
            realm,
        }
    }

    #[test]
    fn header_shape_with_realm() {
        let params = sample_params(
            "https://acct1.suitetalk.api.netsuite.com/services/rest/record/v1/invoice",
            Some("ACCT1"),
        );
        let header = oauth1_auth_header(&params, "fixednonce", 1_700_000_000).unwrap();

        assert!(header.starts_with("OAuth realm=\"ACCT1\", oauth_consumer_key=\"consumer-key\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA256\""));
        assert!(header.contains("oauth_timestamp=\"1700000000\""));
        assert!(header.contains("oauth_version=\"1.0\""));
        assert!(header.contains("oauth_signature=\""));
    }

    #[test]
    fn header_without_realm() {
        let params = sample_params("https://api.example.com/path", None);
        let header = oauth1_auth_header(&params, "n", 1).unwrap();
        assert!(header.starts_with("OAuth oauth_consumer_key="));
    }

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        let params = sample_params("https://api.example.com/path?b=2&a=1", None);
        let first = oauth1_auth_header(&params, "nonce", 42).unwrap();
        let second = oauth1_auth_header(&params, "nonce", 42).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn signature_depends_on_secrets_and_query() {
        let base = sample_params("https://api.example.com/path?a=1", None);
        let signed = oauth1_auth_header(&base, "nonce", 42).unwrap();

        let other_secret = OAuth1SigningParams {
            token_secret: "different",
            ..sample_params("https://api.example.com/path?a=1", None)
        };
        assert_ne!(signed, oauth1_auth_header(&other_secret, "nonce", 42).unwrap());

        let other_query = sample_params("https://api.example.com/path?a=2", None);
        assert_ne!(signed, oauth1_auth_header(&other_query, "nonce", 42).unwrap());
    }

    #[test]
    fn realm_transform() {
        assert_eq!(tba_realm("acct-123"), "ACCT_123");
        assert_eq!(tba_realm("td2950894"), "TD2950894");
    }

    #[test]
    fn nonce_is_alphanumeric() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
