//! Authority configuration.

use crate::auth::AuthConfig;
use std::time::Duration;

/// Configuration for the in-memory authority.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on items returned per query page.
    pub max_page_size: u32,
    /// Longest TTL accepted for objects and items.
    pub max_ttl: Duration,
    /// Largest accepted JSON payload, in serialized bytes.
    pub max_payload_bytes: usize,
    /// Token authentication. `None` accepts any token as the identity.
    pub auth: Option<AuthConfig>,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no authentication.
    pub fn new() -> Self {
        Self {
            max_page_size: 1000,
            max_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            max_payload_bytes: 16 * 1024,
            auth: None,
        }
    }

    /// Sets the maximum page size.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size.max(1);
        self
    }

    /// Sets the maximum TTL.
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Sets the maximum payload size.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Enables HMAC token authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.auth = Some(AuthConfig::new(secret));
        self
    }

    /// Enables token authentication with a full configuration.
    pub fn with_auth_config(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_page_size, 1000);
        assert_eq!(config.max_payload_bytes, 16 * 1024);
        assert!(config.auth.is_none());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_page_size(0)
            .with_max_ttl(Duration::from_secs(60))
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.max_page_size, 1);
        assert_eq!(config.max_ttl, Duration::from_secs(60));
        assert_eq!(config.auth.map(|a| a.secret), Some(vec![1, 2, 3, 4]));
    }
}
