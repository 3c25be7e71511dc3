//! Credential encryption using AES-256-GCM
//!
//! Stored credential blobs are serialized JSON encrypted with AES-256-GCM.
//! The additional authenticated data binds a blob to its owning connection,
//! so a ciphertext copied onto another row fails to decrypt.
//!
//! Wire format: version byte `0x01`, 12-byte nonce, ciphertext with the
//! 16-byte GCM tag appended. Payloads without the version marker are treated
//! as legacy plaintext JSON and passed through.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::credentials::Credentials;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types. Messages never contain key or credential bytes.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    // Legacy plaintext payloads carry no version marker
    if ciphertext[0] != VERSION_ENCRYPTED {
        return Ok(ciphertext.to_vec());
    }

    if ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let ct_and_tag = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(ct_and_tag.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ct_and_tag,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

/// AAD binding a credential blob to its owning connection.
pub fn credential_aad(
    environment_id: Uuid,
    provider_config_key: &str,
    connection_id: &str,
) -> String {
    format!("{environment_id}|{provider_config_key}|{connection_id}")
}

/// Serialize and encrypt a credential for storage.
pub fn encrypt_credentials(
    key: &CryptoKey,
    environment_id: Uuid,
    provider_config_key: &str,
    connection_id: &str,
    credentials: &Credentials,
) -> Result<Vec<u8>, CryptoError> {
    let aad = credential_aad(environment_id, provider_config_key, connection_id);
    let plaintext = serde_json::to_vec(credentials)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    encrypt_bytes(key, aad.as_bytes(), &plaintext)
}

/// Decrypt and deserialize a stored credential blob.
pub fn decrypt_credentials(
    key: &CryptoKey,
    environment_id: Uuid,
    provider_config_key: &str,
    connection_id: &str,
    ciphertext: &[u8],
) -> Result<Credentials, CryptoError> {
    let aad = credential_aad(environment_id, provider_config_key, connection_id);
    let plaintext = decrypt_bytes(key, aad.as_bytes(), ciphertext)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid credential JSON: {e}")))
}

/// Encrypt a bare secret string, such as an OAuth client secret.
pub fn encrypt_secret(key: &CryptoKey, aad: &str, secret: &str) -> Result<Vec<u8>, CryptoError> {
    encrypt_bytes(key, aad.as_bytes(), secret.as_bytes())
}

/// Decrypt a bare secret string.
pub fn decrypt_secret(key: &CryptoKey, aad: &str, ciphertext: &[u8]) -> Result<String, CryptoError> {
    let bytes = decrypt_bytes(key, aad.as_bytes(), ciphertext)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    fn sample_credentials() -> Credentials {
        Credentials::Oauth2 {
            access_token: "access-token".into(),
            refresh_token: Some("refresh-token".into()),
            expires_at: None,
            raw: json!({"access_token": "access-token"}),
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        let aad = b"test-aad";
        let plaintext = b"secret message";

        let encrypted = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, aad, &encrypted).expect("decryption succeeds");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn different_aad_fails() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"aad-1", b"secret").expect("encryption succeeds");
        assert!(decrypt_bytes(&key, b"aad-2", &encrypted).is_err());
    }

    #[test]
    fn modified_ciphertext_fails() {
        let key = test_key();
        let aad = b"test-aad";
        let mut encrypted = encrypt_bytes(&key, aad, b"secret").expect("encryption succeeds");
        encrypted[13] ^= 0x01;
        assert!(decrypt_bytes(&key, aad, &encrypted).is_err());
    }

    #[test]
    fn nonce_uniqueness() {
        let key = test_key();
        let aad = b"test-aad";
        let encrypted1 = encrypt_bytes(&key, aad, b"secret").expect("encryption succeeds");
        let encrypted2 = encrypt_bytes(&key, aad, b"secret").expect("encryption succeeds");
        assert_ne!(&encrypted1[1..13], &encrypted2[1..13]);
    }

    #[test]
    fn legacy_plaintext_passthrough() {
        let key = test_key();
        let legacy = b"legacy-token".to_vec();
        let result = decrypt_bytes(&key, b"aad", &legacy).expect("legacy plaintext is returned");
        assert_eq!(result, legacy);
        assert!(!is_encrypted_payload(&legacy));
    }

    #[test]
    fn credential_blob_roundtrip() {
        let key = test_key();
        let env = Uuid::new_v4();
        let creds = sample_credentials();

        let blob =
            encrypt_credentials(&key, env, "github-prod", "conn-1", &creds).expect("encrypts");
        assert!(is_encrypted_payload(&blob));

        let back = decrypt_credentials(&key, env, "github-prod", "conn-1", &blob).expect("decrypts");
        assert_eq!(back, creds);
    }

    #[test]
    fn credential_blob_bound_to_connection() {
        let key = test_key();
        let env = Uuid::new_v4();
        let creds = sample_credentials();

        let blob =
            encrypt_credentials(&key, env, "github-prod", "conn-1", &creds).expect("encrypts");
        // Same key, different connection identity
        assert!(decrypt_credentials(&key, env, "github-prod", "conn-2", &blob).is_err());
        assert!(decrypt_credentials(&key, Uuid::new_v4(), "github-prod", "conn-1", &blob).is_err());
    }

    #[test]
    fn legacy_plaintext_credential_blob_parses() {
        let key = test_key();
        let creds = sample_credentials();
        let plaintext = serde_json::to_vec(&creds).unwrap();

        let back = decrypt_credentials(&key, Uuid::new_v4(), "pk", "cid", &plaintext)
            .expect("legacy JSON parses");
        assert_eq!(back, creds);
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(CryptoKey::new(vec![0u8; 16]).is_err());
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
    }

    #[test]
    fn insufficient_ciphertext_length() {
        let key = test_key();
        let short = vec![VERSION_ENCRYPTED, 0x02];
        assert!(matches!(
            decrypt_bytes(&key, b"aad", &short),
            Err(CryptoError::InvalidFormat)
        ));
    }

    #[test]
    fn secret_roundtrip() {
        let key = test_key();
        let ct = encrypt_secret(&key, "cfg|github-prod", "client-secret").expect("encrypts");
        let back = decrypt_secret(&key, "cfg|github-prod", &ct).expect("decrypts");
        assert_eq!(back, "client-secret");
    }
}
