//! Session token authentication.
//!
//! Tokens are signed with HMAC-SHA256 and carry an identity and an expiry.
//!
//! ## Token Format
//!
//! `<identity>.<expiry>.<signature>` where:
//! - `identity` is any string (it may itself contain dots)
//! - `expiry` is a Unix timestamp in milliseconds
//! - `signature` is the lowercase hex HMAC-SHA256 of `<identity>.<expiry>`

use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// How long issued tokens stay valid.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the token lifetime.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates session tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `identity`, valid for the configured lifetime.
    pub fn create_token(&self, identity: &str) -> ServerResult<String> {
        let lifetime = chrono::Duration::from_std(self.config.token_expiry)
            .map_err(|e| ServerError::Internal(format!("token expiry out of range: {e}")))?;
        self.create_token_expiring(identity, Utc::now() + lifetime)
    }

    /// Issues a token for `identity` that expires at `expires_at`.
    pub fn create_token_expiring(
        &self,
        identity: &str,
        expires_at: DateTime<Utc>,
    ) -> ServerResult<String> {
        let payload = format!("{identity}.{}", expires_at.timestamp_millis());
        let signature = self.sign(payload.as_bytes())?;
        Ok(format!("{payload}.{}", to_hex(&signature)))
    }

    /// Validates a token, returning the identity it was issued for.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        self.validate_token_at(token, Utc::now())
    }

    /// Validates a token as of `now`.
    pub fn validate_token_at(&self, token: &str, now: DateTime<Utc>) -> ServerResult<String> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;
        let (identity, expiry) = payload
            .rsplit_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;
        let signature = from_hex(signature)
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed signature".into()))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let expiry: i64 = expiry
            .parse()
            .map_err(|_| ServerError::AuthenticationFailed("malformed expiry".into()))?;
        let expires_at = Utc
            .timestamp_millis_opt(expiry)
            .single()
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed expiry".into()))?;
        if now >= expires_at {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(identity.to_string())
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid HMAC key: {e}")))
    }

    fn sign(&self, data: &[u8]) -> ServerResult<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}
