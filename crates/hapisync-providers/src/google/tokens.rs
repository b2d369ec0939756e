//! OAuth token types and at-rest credential encryption.
//!
//! Connection rows keep the access/refresh pair encrypted with AES-256-GCM.
//! [`TokenCipher`] seals a [`TokenInfo`] into a base64 string and opens it
//! again; the orchestrator's token manager is the only caller.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};

/// Tokens are considered expired this long before the provider says so.
const EXPIRY_BUFFER_SECS: i64 = 60;

const NONCE_LEN: usize = 12;

/// The decrypted credential pair of a connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// True once the access token is within the expiry buffer.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(EXPIRY_BUFFER_SECS) >= expires_at,
            None => false,
        }
    }

    /// Applies a refresh response. Google only sometimes rotates the refresh
    /// token, so the old one is kept when none is returned.
    pub fn apply_refresh(&mut self, refreshed: RefreshedToken, now: DateTime<Utc>) {
        self.access_token = refreshed.access_token;
        self.expires_at = refreshed.expires_in.map(|secs| now + Duration::seconds(secs));
        if let Some(rotated) = refreshed.refresh_token {
            self.refresh_token = Some(rotated);
        }
    }

    /// The short-lived token handed to provider calls.
    pub fn access(&self) -> AccessToken {
        AccessToken {
            secret: self.access_token.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A bearer token for a single provider call.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Fails with `AuthExpired` instead of sending a request with a dead token.
    ///
    /// Refreshing is not done here; it is coordinated per connection.
    pub fn ensure_fresh(&self, now: DateTime<Utc>) -> ProviderResult<()> {
        match self.expires_at {
            Some(expires_at) if now >= expires_at => Err(ProviderError::auth_expired(format!(
                "access token expired at {expires_at}"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of exchanging a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// AES-256-GCM sealing of credentials stored on connection rows.
///
/// Payload layout: base64(nonce || ciphertext).
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").field("key", &"[REDACTED]").finish()
    }
}

impl TokenCipher {
    /// Builds a cipher from a raw 32-byte key.
    pub fn new(key: &[u8]) -> ProviderResult<Self> {
        if key.len() != 32 {
            return Err(ProviderError::configuration(format!(
                "encryption key must be exactly 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ProviderError::configuration(format!("invalid encryption key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Builds a cipher from a base64-encoded 32-byte key, as found in config.
    pub fn from_base64_key(encoded: &str) -> ProviderResult<Self> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| ProviderError::configuration(format!("encryption key is not base64: {e}")))?;
        Self::new(&key)
    }

    /// Generates a random key, base64-encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key);
        BASE64.encode(key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> ProviderResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(&Nonce::from(nonce), plaintext)
            .map_err(|e| ProviderError::internal(format!("encryption failed: {e}")))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    /// Decrypts a payload. Any failure means the stored credentials are
    /// unusable and the user must reconnect.
    pub fn decrypt(&self, payload: &str) -> ProviderResult<Vec<u8>> {
        let raw = BASE64
            .decode(payload)
            .map_err(|e| ProviderError::auth_expired(format!("stored credentials unreadable: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(ProviderError::auth_expired("stored credentials truncated"));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| ProviderError::internal("nonce must be 12 bytes"))?;
        self.cipher
            .decrypt(&Nonce::from(nonce), ciphertext)
            .map_err(|_| ProviderError::auth_expired("stored credentials failed to decrypt"))
    }

    pub fn seal(&self, tokens: &TokenInfo) -> ProviderResult<String> {
        let json = serde_json::to_vec(tokens)
            .map_err(|e| ProviderError::internal(format!("failed to serialize tokens: {e}")))?;
        self.encrypt(&json)
    }

    pub fn open(&self, payload: &str) -> ProviderResult<TokenInfo> {
        let json = self.decrypt(payload)?;
        serde_json::from_slice(&json)
            .map_err(|e| ProviderError::auth_expired(format!("stored credentials malformed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorCode;
    use chrono::TimeZone;

    fn cipher() -> TokenCipher {
        TokenCipher::new(&[7u8; 32]).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn seal_and_open() {
        let tokens = TokenInfo::new("ya29.access", Some("1//refresh".into()), Some(now()));
        let sealed = cipher().seal(&tokens).unwrap();
        assert!(!sealed.contains("ya29"));
        assert_eq!(cipher().open(&sealed).unwrap(), tokens);
    }

    #[test]
    fn nonce_differs_between_encryptions() {
        let c = cipher();
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
    }

    #[test]
    fn wrong_key_requires_reconnect() {
        let sealed = cipher().encrypt(b"secret").unwrap();
        let other = TokenCipher::new(&[8u8; 32]).unwrap();
        let err = other.decrypt(&sealed).unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthExpired);
        assert!(cipher().decrypt("AAAA").is_err());
    }

    #[test]
    fn key_length_is_checked() {
        assert!(TokenCipher::new(&[0u8; 16]).is_err());
        assert!(TokenCipher::from_base64_key(&TokenCipher::generate_key()).is_ok());
        assert!(TokenCipher::from_base64_key("not base64!").is_err());
    }

    #[test]
    fn expiry_uses_buffer() {
        let tokens = TokenInfo::new("a", None, Some(now() + Duration::seconds(30)));
        assert!(tokens.is_expired(now()));
        let tokens = TokenInfo::new("a", None, Some(now() + Duration::minutes(10)));
        assert!(!tokens.is_expired(now()));
        assert!(!TokenInfo::new("a", None, None).is_expired(now()));
    }

    #[test]
    fn refresh_keeps_existing_refresh_token() {
        let mut tokens = TokenInfo::new("old", Some("r1".into()), Some(now()));
        tokens.apply_refresh(
            RefreshedToken {
                access_token: "new".into(),
                expires_in: Some(3600),
                refresh_token: None,
            },
            now(),
        );
        assert_eq!(tokens.access_token, "new");
        assert_eq!(tokens.refresh_token.as_deref(), Some("r1"));
        assert_eq!(tokens.expires_at, Some(now() + Duration::hours(1)));
    }

    #[test]
    fn access_token_guards_expiry() {
        let token = AccessToken::new("t", Some(now()));
        assert_eq!(
            token.ensure_fresh(now()).unwrap_err().code(),
            ProviderErrorCode::AuthExpired
        );
        assert!(token.ensure_fresh(now() - Duration::seconds(1)).is_ok());
        assert!(format!("{token:?}").contains("[REDACTED]"));
    }
}
