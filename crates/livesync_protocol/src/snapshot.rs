//! Snapshots of authority state.

use crate::ids::{ItemId, ObjectKind, PageToken, Sid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A JSON object payload.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// State of an object as known to the authority at some revision.
///
/// For documents `data` carries the document body. Lists, maps and
/// streams carry only metadata and leave `data` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// Authority-assigned identifier.
    pub sid: Sid,
    /// Optional caller-chosen unique name.
    pub unique_name: Option<String>,
    /// Object kind.
    pub kind: ObjectKind,
    /// Monotonic per-object revision.
    pub revision: u64,
    /// Creation time.
    pub date_created: DateTime<Utc>,
    /// Last modification time.
    pub date_updated: DateTime<Utc>,
    /// Expiration time, if a TTL is set.
    pub date_expires: Option<DateTime<Utc>>,
    /// Document body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonObject>,
    /// Latest item revision of a list or map. Zero for other kinds.
    #[serde(default)]
    pub item_revision: u64,
}

impl ObjectSnapshot {
    /// Returns true if this snapshot is strictly newer than `revision`.
    pub fn is_newer_than(&self, revision: u64) -> bool {
        self.revision > revision
    }
}

/// State of a single list or map item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    /// SID of the owning collection.
    pub collection_sid: Sid,
    /// Index or key of the item.
    pub item_id: ItemId,
    /// Item body.
    pub data: JsonObject,
    /// Revision at which this item state was produced.
    pub revision: u64,
    /// Creation time.
    pub date_created: DateTime<Utc>,
    /// Last modification time.
    pub date_updated: DateTime<Utc>,
    /// Expiration time, if an item TTL is set.
    pub date_expires: Option<DateTime<Utc>>,
}

impl ItemSnapshot {
    /// Returns the list index, if this is a list item.
    pub fn index(&self) -> Option<u64> {
        self.item_id.index()
    }

    /// Returns the map key, if this is a map item.
    pub fn key(&self) -> Option<&str> {
        self.item_id.key()
    }
}

/// A message published to a stream. Messages are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Message identifier.
    pub sid: Sid,
    /// SID of the stream the message was published to.
    pub stream_sid: Sid,
    /// Message body.
    pub data: JsonObject,
}

/// One page of an item query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsPage {
    /// Items in query order.
    pub items: Vec<ItemSnapshot>,
    /// Token for the next page, absent on the last page.
    pub next_page: Option<PageToken>,
}

impl ItemsPage {
    /// Creates the final page of a query.
    pub fn last(items: Vec<ItemSnapshot>) -> Self {
        Self {
            items,
            next_page: None,
        }
    }
}
