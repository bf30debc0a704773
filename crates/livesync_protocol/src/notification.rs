//! Pushes delivered by the authority to subscribed clients.

use crate::ids::{ItemId, ObjectKind, Sid};
use crate::snapshot::{ItemSnapshot, ObjectSnapshot, StreamMessage};
use serde::{Deserialize, Serialize};

/// A change pushed by the authority for a subscribed object.
///
/// Pushes may arrive late or duplicated; receivers compare revisions
/// and discard anything not newer than what they already hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Notification {
    /// Object metadata or document data changed.
    ObjectUpdated(ObjectSnapshot),
    /// The object was removed.
    ObjectRemoved {
        /// Removed object.
        sid: Sid,
        /// Its kind.
        kind: ObjectKind,
    },
    /// A collection item was added.
    ItemAdded(ItemSnapshot),
    /// A collection item was replaced.
    ItemUpdated(ItemSnapshot),
    /// A collection item was removed.
    ItemRemoved {
        /// Owning collection.
        collection_sid: Sid,
        /// Removed item.
        item_id: ItemId,
        /// Revision at which the removal happened.
        revision: u64,
    },
    /// A message was published to a stream.
    MessagePublished(StreamMessage),
}

impl Notification {
    /// Returns the SID of the object this push concerns.
    pub fn sid(&self) -> &Sid {
        match self {
            Notification::ObjectUpdated(snapshot) => &snapshot.sid,
            Notification::ObjectRemoved { sid, .. } => sid,
            Notification::ItemAdded(item) | Notification::ItemUpdated(item) => &item.collection_sid,
            Notification::ItemRemoved { collection_sid, .. } => collection_sid,
            Notification::MessagePublished(message) => &message.stream_sid,
        }
    }

    /// Short event name for logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::ObjectUpdated(_) => "object_updated",
            Notification::ObjectRemoved { .. } => "object_removed",
            Notification::ItemAdded(_) => "item_added",
            Notification::ItemUpdated(_) => "item_updated",
            Notification::ItemRemoved { .. } => "item_removed",
            Notification::MessagePublished(_) => "message_published",
        }
    }
}

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Establishing a connection.
    Connecting,
    /// Connected and able to exchange commands.
    Connected,
    /// Not connected; the transport will retry.
    #[default]
    Disconnected,
    /// The authority rejected the credentials.
    Denied,
    /// An unrecoverable error occurred.
    FatalError,
}

impl ConnectionState {
    /// Returns true if commands can be issued.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if the transport will not recover on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Denied | ConnectionState::FatalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_of_removal() {
        let n = Notification::ItemRemoved {
            collection_sid: Sid::new("MP1"),
            item_id: ItemId::Key("a".into()),
            revision: 3,
        };
        assert_eq!(n.sid().as_str(), "MP1");
        assert_eq!(n.event_name(), "item_removed");
    }

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Denied.is_terminal());
        assert!(ConnectionState::FatalError.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Connected.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
