//! Object identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a synchronized object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A single JSON object.
    Document,
    /// An ordered collection of items addressed by integer index.
    List,
    /// A collection of items addressed by string key.
    Map,
    /// A publish/subscribe channel with no persisted state.
    Stream,
}

impl ObjectKind {
    /// All kinds, in declaration order.
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Document,
        ObjectKind::List,
        ObjectKind::Map,
        ObjectKind::Stream,
    ];

    /// Returns the two-letter prefix the authority assigns to SIDs of this kind.
    pub fn sid_prefix(&self) -> &'static str {
        match self {
            ObjectKind::Document => "ET",
            ObjectKind::List => "ES",
            ObjectKind::Map => "MP",
            ObjectKind::Stream => "TO",
        }
    }

    /// Resolves a kind from a SID prefix.
    pub fn from_sid_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.sid_prefix() == prefix)
    }

    /// Returns true for lists and maps.
    pub fn is_collection(&self) -> bool {
        matches!(self, ObjectKind::List | ObjectKind::Map)
    }

    /// Human-readable name, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Document => "document",
            ObjectKind::List => "list",
            ObjectKind::Map => "map",
            ObjectKind::Stream => "stream",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authority-assigned object identifier.
///
/// SIDs are opaque strings; the first two characters encode the object
/// kind (`ET` documents, `ES` lists, `MP` maps, `TO` streams).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(String);

impl Sid {
    /// Wraps a raw SID string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the SID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the object kind encoded in the SID prefix, if recognized.
    pub fn kind(&self) -> Option<ObjectKind> {
        self.0.get(..2).and_then(ObjectKind::from_sid_prefix)
    }

    /// Returns true if `value` looks like a SID of the given kind.
    ///
    /// Used to decide whether a caller-supplied reference is a SID or a
    /// unique name.
    pub fn looks_like(value: &str, kind: ObjectKind) -> bool {
        value.len() > 2 && value.starts_with(kind.sid_prefix())
    }

    /// Consumes the SID, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Sid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Sid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of an item within a collection.
///
/// List items are addressed by an authority-assigned index, map items by
/// a caller-chosen key. Ordering is by index for lists and lexicographic
/// by key for maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemId {
    /// List item index.
    Index(u64),
    /// Map item key.
    Key(String),
}

impl ItemId {
    /// Returns the list index, if this is a list item id.
    pub fn index(&self) -> Option<u64> {
        match self {
            ItemId::Index(i) => Some(*i),
            ItemId::Key(_) => None,
        }
    }

    /// Returns the map key, if this is a map item id.
    pub fn key(&self) -> Option<&str> {
        match self {
            ItemId::Index(_) => None,
            ItemId::Key(k) => Some(k),
        }
    }

    /// Returns the collection kind this id addresses.
    pub fn collection_kind(&self) -> ObjectKind {
        match self {
            ItemId::Index(_) => ObjectKind::List,
            ItemId::Key(_) => ObjectKind::Map,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Index(i) => write!(f, "{i}"),
            ItemId::Key(k) => f.write_str(k),
        }
    }
}

impl From<u64> for ItemId {
    fn from(index: u64) -> Self {
        ItemId::Index(index)
    }
}

impl From<&str> for ItemId {
    fn from(key: &str) -> Self {
        ItemId::Key(key.to_string())
    }
}

impl From<String> for ItemId {
    fn from(key: String) -> Self {
        ItemId::Key(key)
    }
}

/// Opaque continuation token for paged item queries.
///
/// Encodes the last item returned by the previous page; the next page
/// resumes strictly after it in the query's order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    /// Creates a token that resumes after `item_id`.
    pub fn after(item_id: &ItemId) -> Self {
        match item_id {
            ItemId::Index(i) => Self(format!("i:{i}")),
            ItemId::Key(k) => Self(format!("k:{k}")),
        }
    }

    /// Decodes the item id this token resumes after.
    pub fn resume_after(&self) -> ProtocolResult<ItemId> {
        match self.0.split_once(':') {
            Some(("i", index)) => index
                .parse()
                .map(ItemId::Index)
                .map_err(|_| ProtocolError::InvalidPageToken(self.0.clone())),
            Some(("k", key)) => Ok(ItemId::Key(key.to_string())),
            _ => Err(ProtocolError::InvalidPageToken(self.0.clone())),
        }
    }

    /// Returns the raw token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
