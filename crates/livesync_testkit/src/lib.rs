//! # Livesync Testkit
//!
//! Test utilities for livesync.
//!
//! This crate provides:
//! - `LoopbackTransport`, an in-process transport to a reference authority
//! - Token providers backed by the authority
//! - Test fixtures with an authority and connected clients
//! - Recording listeners with async waits
//! - Property-based test generators using proptest
//! - Stress helpers for concurrent writers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_authority() {
//!     let bed = TestBed::new();
//!     let alice = bed.client("alice").await;
//!     let doc = alice.documents().create(None, None).await.unwrap();
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod loopback;
pub mod recorder;
pub mod stress;
pub mod tokens;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::loopback::*;
    pub use crate::recorder::*;
    pub use crate::stress::*;
    pub use crate::tokens::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;
pub use loopback::*;
pub use recorder::*;
pub use stress::*;
pub use tokens::*;

/// Installs a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
