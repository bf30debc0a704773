//! Commands issued by clients and the replies the authority returns.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ItemId, ObjectKind, PageToken, Sid};
use crate::snapshot::{ItemSnapshot, ItemsPage, JsonObject, ObjectSnapshot, StreamMessage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request from a client to the authority.
///
/// `target` fields accept either a SID or a unique name; the authority
/// resolves SIDs first and falls back to unique names within the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Command {
    /// Create a new object.
    Create {
        /// Object kind.
        kind: ObjectKind,
        /// Optional unique name; creation fails if it is taken.
        unique_name: Option<String>,
        /// Optional time-to-live.
        ttl: Option<Duration>,
    },
    /// Fetch an existing object's current snapshot.
    Open {
        /// Object kind.
        kind: ObjectKind,
        /// SID or unique name.
        target: String,
    },
    /// Replace a document's data.
    UpdateDocument {
        /// SID or unique name.
        target: String,
        /// New document body.
        data: JsonObject,
        /// Reject with a precondition failure unless the current revision matches.
        if_revision: Option<u64>,
        /// Optionally reset the TTL in the same step.
        ttl: Option<Duration>,
    },
    /// Change an object's TTL. A zero TTL clears the expiration.
    SetTtl {
        /// Object kind.
        kind: ObjectKind,
        /// SID or unique name.
        target: String,
        /// New time-to-live.
        ttl: Duration,
        /// Reject with a precondition failure unless the current revision matches.
        if_revision: Option<u64>,
    },
    /// Remove an object.
    Remove {
        /// Object kind.
        kind: ObjectKind,
        /// SID or unique name.
        target: String,
    },
    /// Fetch a single collection item.
    GetItem {
        /// Collection kind.
        kind: ObjectKind,
        /// SID or unique name of the collection.
        target: String,
        /// Item to fetch.
        item_id: ItemId,
    },
    /// Append an item to a list. The authority assigns the index.
    AddListItem {
        /// SID or unique name of the list.
        target: String,
        /// Item body.
        data: JsonObject,
        /// Optional item time-to-live.
        ttl: Option<Duration>,
    },
    /// Replace a collection item. For maps this creates the key if missing.
    SetItem {
        /// Collection kind.
        kind: ObjectKind,
        /// SID or unique name of the collection.
        target: String,
        /// Item to write.
        item_id: ItemId,
        /// Item body.
        data: JsonObject,
        /// Reject with a precondition failure unless the item revision
        /// matches. Revision `0` requires the item to be absent.
        if_revision: Option<u64>,
        /// Optional item time-to-live.
        ttl: Option<Duration>,
    },
    /// Remove a collection item.
    RemoveItem {
        /// Collection kind.
        kind: ObjectKind,
        /// SID or unique name of the collection.
        target: String,
        /// Item to remove.
        item_id: ItemId,
    },
    /// Fetch one page of collection items.
    QueryItems(ItemsQuery),
    /// Publish a message to a stream.
    PublishMessage {
        /// SID or unique name of the stream.
        target: String,
        /// Message body.
        data: JsonObject,
    },
    /// Start receiving pushes for a batch of objects.
    Subscribe {
        /// Objects to subscribe to.
        requests: Vec<SubscriptionRequest>,
    },
    /// Stop receiving pushes for a batch of objects.
    Unsubscribe {
        /// Objects to unsubscribe from.
        sids: Vec<Sid>,
    },
}

impl Command {
    /// Short command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Open { .. } => "open",
            Command::UpdateDocument { .. } => "update_document",
            Command::SetTtl { .. } => "set_ttl",
            Command::Remove { .. } => "remove",
            Command::GetItem { .. } => "get_item",
            Command::AddListItem { .. } => "add_list_item",
            Command::SetItem { .. } => "set_item",
            Command::RemoveItem { .. } => "remove_item",
            Command::QueryItems(_) => "query_items",
            Command::PublishMessage { .. } => "publish_message",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// Returns the SID or unique name this command addresses, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Command::Open { target, .. }
            | Command::UpdateDocument { target, .. }
            | Command::SetTtl { target, .. }
            | Command::Remove { target, .. }
            | Command::GetItem { target, .. }
            | Command::AddListItem { target, .. }
            | Command::SetItem { target, .. }
            | Command::RemoveItem { target, .. }
            | Command::PublishMessage { target, .. } => Some(target),
            Command::QueryItems(query) => Some(&query.target),
            Command::Create { .. } | Command::Subscribe { .. } | Command::Unsubscribe { .. } => {
                None
            }
        }
    }
}

/// One entry of a subscribe batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Object to subscribe to.
    pub sid: Sid,
    /// Kind of the object.
    pub kind: ObjectKind,
    /// For collections: the latest item revision the subscriber has seen.
    /// Item changes after it are replayed once the subscription is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_item_revision: Option<u64>,
}

impl SubscriptionRequest {
    /// Subscribes to `sid` without replaying item changes.
    pub fn new(sid: Sid, kind: ObjectKind) -> Self {
        Self {
            sid,
            kind,
            since_item_revision: None,
        }
    }

    /// Replays item changes newer than `revision`.
    pub fn resuming_after(mut self, revision: u64) -> Self {
        self.since_item_revision = Some(revision);
        self
    }
}

/// Error code carried by a failed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorCode {
    /// The object does not exist.
    NotFound,
    /// The identity may not access the object.
    PermissionDenied,
    /// The request was malformed.
    InvalidRequest,
    /// The authority failed internally.
    Internal,
}

/// Error reported by the authority for a single entry of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error category.
    pub code: RemoteErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Creates a new remote error.
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of a single subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum SubscriptionOutcome {
    /// Pushes will be delivered for this object.
    Established,
    /// The subscription was rejected.
    Failed(RemoteError),
}

/// Per-object result of a subscribe batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResult {
    /// Object the result refers to.
    pub sid: Sid,
    /// Outcome of the request.
    pub outcome: SubscriptionOutcome,
}

/// Iteration order for item queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrder {
    /// Ascending index or key order.
    #[default]
    Ascending,
    /// Descending index or key order.
    Descending,
}

/// Parameters for a paged item query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsQuery {
    /// Collection kind.
    pub kind: ObjectKind,
    /// SID or unique name of the collection.
    pub target: String,
    /// Item to start from. `None` starts at the first item in `order`.
    pub from: Option<ItemId>,
    /// Whether the item at `from` is included.
    pub include_from: bool,
    /// Iteration order.
    pub order: QueryOrder,
    /// Maximum number of items per page.
    pub page_size: u32,
    /// Continuation token from the previous page.
    pub page_token: Option<PageToken>,
}

/// A reply from the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Reply {
    /// An object snapshot.
    Object(ObjectSnapshot),
    /// An item snapshot.
    Item {
        /// The item state.
        item: ItemSnapshot,
        /// True if the command created the item.
        created: bool,
    },
    /// A page of items.
    Items(ItemsPage),
    /// A published stream message.
    Message(StreamMessage),
    /// Per-object subscribe results.
    Subscriptions(Vec<SubscriptionResult>),
    /// Acknowledgement carrying the revision the command produced.
    Revision(u64),
    /// Acknowledgement with no payload.
    Done,
}

impl Reply {
    /// Short reply name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Object(_) => "object",
            Reply::Item { .. } => "item",
            Reply::Items(_) => "items",
            Reply::Message(_) => "message",
            Reply::Subscriptions(_) => "subscriptions",
            Reply::Revision(_) => "revision",
            Reply::Done => "done",
        }
    }

    fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedReply {
            expected,
            actual: self.name(),
        }
    }

    /// Extracts an object snapshot.
    pub fn into_object(self) -> ProtocolResult<ObjectSnapshot> {
        match self {
            Reply::Object(snapshot) => Ok(snapshot),
            other => Err(other.unexpected("object")),
        }
    }

    /// Extracts an item snapshot and whether it was created.
    pub fn into_item(self) -> ProtocolResult<(ItemSnapshot, bool)> {
        match self {
            Reply::Item { item, created } => Ok((item, created)),
            other => Err(other.unexpected("item")),
        }
    }

    /// Extracts a page of items.
    pub fn into_items(self) -> ProtocolResult<ItemsPage> {
        match self {
            Reply::Items(page) => Ok(page),
            other => Err(other.unexpected("items")),
        }
    }

    /// Extracts a published message.
    pub fn into_message(self) -> ProtocolResult<StreamMessage> {
        match self {
            Reply::Message(message) => Ok(message),
            other => Err(other.unexpected("message")),
        }
    }

    /// Extracts subscribe results.
    pub fn into_subscriptions(self) -> ProtocolResult<Vec<SubscriptionResult>> {
        match self {
            Reply::Subscriptions(results) => Ok(results),
            other => Err(other.unexpected("subscriptions")),
        }
    }

    /// Extracts the revision of an acknowledgement.
    pub fn into_revision(self) -> ProtocolResult<u64> {
        match self {
            Reply::Revision(revision) => Ok(revision),
            other => Err(other.unexpected("revision")),
        }
    }

    /// Checks for a bare acknowledgement.
    pub fn into_done(self) -> ProtocolResult<()> {
        match self {
            Reply::Done => Ok(()),
            other => Err(other.unexpected("done")),
        }
    }
}
