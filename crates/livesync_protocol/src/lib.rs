//! # Livesync Protocol
//!
//! Shared data model for livesync clients and the authority.
//!
//! This crate provides:
//! - `Sid`, `ObjectKind` and `ItemId` identifiers
//! - `ObjectSnapshot`, `ItemSnapshot` and `StreamMessage` payloads
//! - `Command` / `Reply` request pairs issued by clients
//! - `Notification` pushes and `ConnectionState` reported by transports
//!
//! This is a pure protocol crate with no I/O operations. Byte-level wire
//! framing is left to transports; every type here is `serde`-serializable.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod ids;
mod messages;
mod notification;
mod snapshot;

pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ItemId, ObjectKind, PageToken, Sid};
pub use messages::{
    Command, ItemsQuery, QueryOrder, RemoteError, RemoteErrorCode, Reply, SubscriptionOutcome,
    SubscriptionRequest, SubscriptionResult,
};
pub use notification::{ConnectionState, Notification};
pub use snapshot::{ItemSnapshot, ItemsPage, JsonObject, ObjectSnapshot, StreamMessage};
