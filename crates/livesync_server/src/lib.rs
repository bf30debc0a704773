//! # Livesync Server
//!
//! In-memory reference authority for livesync clients.
//!
//! This crate provides:
//! - `ObjectStore`, the revisioned store of documents, lists, maps and streams
//! - `Authority`, which adds sessions, subscriptions and push fan-out
//! - Session tokens signed with HMAC-SHA256
//! - Access revocation and TTL expiry sweeps
//!
//! # Architecture
//!
//! The authority owns every object. Each write bumps a revision and the
//! resulting change is pushed to every session subscribed to the object,
//! the writer's own session included. Clients reach the authority through
//! a transport; the testkit crate provides an in-process one.
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust
//! use livesync_server::{Authority, ServerConfig};
//! use std::sync::Arc;
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret-32-bytes-long!".to_vec());
//! let authority = Authority::new(config);
//!
//! let token = authority.issue_token("alice").unwrap();
//! assert!(authority.open_session("alice", Arc::new(|_| {})).is_err());
//! assert!(authority.open_session(&token, Arc::new(|_| {})).is_ok());
//! ```
//!
//! # Revisions
//!
//! - Object revisions start at 1 and count metadata and document changes
//! - Collection items carry revisions from a per-collection counter, so an
//!   item removal is always newer than the item state it removes
//! - List indices are assigned by the authority and never reused

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod store;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{Authority, PushSink, SessionId};
pub use store::ObjectStore;
