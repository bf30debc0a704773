//! Test fixtures: an authority with connected clients.
//!
//! Provides convenience functions for setting up an in-process authority
//! and clients attached to it through loopback transports.

use crate::loopback::LoopbackTransport;
use crate::tokens::AuthorityTokenProvider;
use livesync_engine::{List, Map, MutateConfig, RetryConfig, SyncClient, SyncConfig};
use livesync_protocol::{Command, JsonObject, Reply};
use livesync_server::{Authority, ServerConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Client configuration with short, jitter-free retry delays.
pub fn fast_config() -> SyncConfig {
    SyncConfig::new()
        .with_subscription_retry(
            RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(50))
                .with_jitter(false),
        )
        .with_mutate(MutateConfig::new(8).with_retry(
            RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(10))
                .with_jitter(false),
        ))
}

/// Builds a JSON object from a `json!` value.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn object(value: serde_json::Value) -> JsonObject {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A client connected to a [`TestBed`].
pub struct TestClient {
    /// The client.
    pub client: SyncClient,
    /// Its transport, for driving the connection.
    pub transport: Arc<LoopbackTransport>,
    /// Its token provider.
    pub tokens: Arc<AuthorityTokenProvider>,
}

impl std::ops::Deref for TestClient {
    type Target = SyncClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// An in-process authority for tests.
pub struct TestBed {
    /// The authority.
    pub authority: Arc<Authority>,
}

impl TestBed {
    /// Creates a test bed with a default authority.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a test bed with the given authority configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            authority: Arc::new(Authority::new(config)),
        }
    }

    /// Creates a test bed whose authority requires signed tokens.
    pub fn with_auth() -> Self {
        Self::with_config(ServerConfig::new().with_auth(b"testkit-secret-32-bytes-long!!!".to_vec()))
    }

    /// Connects a client for `identity` using [`fast_config`].
    pub async fn client(&self, identity: &str) -> TestClient {
        self.client_with_config(identity, fast_config()).await
    }

    /// Connects a client for `identity` with `config`.
    pub async fn client_with_config(&self, identity: &str, config: SyncConfig) -> TestClient {
        let transport = LoopbackTransport::new(Arc::clone(&self.authority));
        let tokens = AuthorityTokenProvider::new(Arc::clone(&self.authority), identity);
        let client = SyncClient::connect(config, transport.clone(), tokens.clone())
            .await
            .expect("Failed to connect test client");
        TestClient {
            client,
            transport,
            tokens,
        }
    }

    /// Applies a command with authority privileges.
    pub fn admin(&self, command: Command) -> Reply {
        self.authority
            .handle_as_admin(command)
            .expect("Admin command failed")
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a list named `name` holding `count` items `{"n": i}`.
    pub async fn populated_list(client: &SyncClient, name: &str, count: u64) -> List {
        let list = client
            .lists()
            .open_or_create(name, None)
            .await
            .expect("Failed to create list");
        for n in 0..count {
            list.add_item(object(json!({ "n": n })))
                .await
                .expect("Failed to add list item");
        }
        list
    }

    /// Creates a map named `name` with one item per key.
    pub async fn populated_map(client: &SyncClient, name: &str, keys: &[&str]) -> Map {
        let map = client
            .maps()
            .open_or_create(name, None)
            .await
            .expect("Failed to create map");
        for key in keys {
            map.set_item(key, object(json!({ "key": key })))
                .await
                .expect("Failed to set map item");
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_engine::QueryOptions;
    use livesync_protocol::ConnectionState;

    #[tokio::test]
    async fn client_connects() {
        let bed = TestBed::new();
        let alice = bed.client("alice").await;
        assert_eq!(alice.connection_state(), ConnectionState::Connected);
        assert_eq!(alice.tokens.fetch_count(), 1);
        assert_eq!(bed.authority.session_count(), 1);
    }

    #[tokio::test]
    async fn authenticated_bed() {
        let bed = TestBed::with_auth();
        let alice = bed.client("alice").await;
        assert!(alice.transport.token().unwrap().starts_with("alice."));
    }

    #[tokio::test]
    async fn populated_list_scenario() {
        let bed = TestBed::new();
        let alice = bed.client("alice").await;
        let list = scenarios::populated_list(&alice, "numbers", 5).await;
        let items = list
            .query_items(QueryOptions::new())
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(items.len(), 5);
    }

    #[test]
    #[should_panic(expected = "expected a JSON object")]
    fn object_rejects_non_objects() {
        object(json!([1, 2]));
    }
}
