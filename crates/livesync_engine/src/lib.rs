//! # Livesync Engine
//!
//! Client-side engine keeping shared, versioned JSON objects in sync with
//! a remote authority.
//!
//! This crate provides:
//! - `SyncClient`, the entry point, and per-kind facades
//!   (`documents()`, `lists()`, `maps()`, `streams()`)
//! - `Document`, `List`, `Map` and `Stream` handles backed by one shared
//!   cache entry per SID
//! - A subscription manager that establishes, suspends and recovers push
//!   delivery with batched subscribes and backoff
//! - Optimistic-concurrency mutations with conflict retry
//! - `ItemIterator`, a paged sequence over list and map items
//!
//! ## Architecture
//!
//! The engine talks to the authority through the [`Transport`] trait:
//! request/response commands go out, and pushes plus connection state
//! changes come back as [`TransportEvent`]s consumed by one dispatch task
//! per client.
//!
//! ## Key Invariants
//!
//! - One in-memory instance per SID, shared by every open handle
//! - Revisions only move forward; stale or duplicate pushes are dropped
//! - A removed object stays removed and emits nothing after its removal
//! - Cache updates, subscription transitions and listener calls are
//!   serialized by a per-client dispatch gate
//! - No lock is held across an `.await`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod error;
mod id;
mod iterator;
mod listeners;
mod mutator;
mod objects;
mod subscription;
mod transport;

pub use cache::ObjectEvent;
pub use client::SyncClient;
pub use config::{MutateConfig, RetryConfig, SyncConfig, DEFAULT_MAX_TTL};
pub use error::{SyncError, SyncResult};
pub use id::SyncObjectId;
pub use iterator::{ItemIterator, QueryOptions};
pub use listeners::{ListenerId, ListenerRegistry};
pub use objects::{
    Document, DocumentKind, Documents, List, ListKind, Lists, Map, MapKind, Maps, ObjectType,
    Objects, Stream, StreamKind, Streams, SyncObject,
};
pub use subscription::{SubscriptionState, SubscriptionStats};
pub use transport::{
    EventSink, MockTransport, StaticTokenProvider, TokenProvider, Transport, TransportEvent,
};

pub use livesync_protocol::{
    ConnectionState, ItemId, ItemSnapshot, JsonObject, ObjectKind, ObjectSnapshot, QueryOrder,
    Sid, StreamMessage,
};
