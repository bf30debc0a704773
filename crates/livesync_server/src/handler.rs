//! Command handling against the object store.

use crate::error::{ServerError, ServerResult};
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use livesync_protocol::{Command, Notification, ObjectKind, Reply};

/// The result of applying a command: the reply for the caller and the
/// pushes for subscribers.
#[derive(Debug)]
pub(crate) struct Handled {
    pub(crate) reply: Reply,
    pub(crate) pushes: Vec<Notification>,
}

impl Handled {
    fn reply(reply: Reply) -> Self {
        Self {
            reply,
            pushes: Vec::new(),
        }
    }

    fn with_push(reply: Reply, push: Notification) -> Self {
        Self {
            reply,
            pushes: vec![push],
        }
    }
}

/// Returns the kind and reference of the object a command addresses.
pub(crate) fn target_of(command: &Command) -> Option<(ObjectKind, &str)> {
    match command {
        Command::Open { kind, target }
        | Command::SetTtl { kind, target, .. }
        | Command::Remove { kind, target }
        | Command::GetItem { kind, target, .. }
        | Command::SetItem { kind, target, .. }
        | Command::RemoveItem { kind, target, .. } => Some((*kind, target.as_str())),
        Command::UpdateDocument { target, .. } => Some((ObjectKind::Document, target.as_str())),
        Command::AddListItem { target, .. } => Some((ObjectKind::List, target.as_str())),
        Command::PublishMessage { target, .. } => Some((ObjectKind::Stream, target.as_str())),
        Command::QueryItems(query) => Some((query.kind, query.target.as_str())),
        Command::Create { .. } | Command::Subscribe { .. } | Command::Unsubscribe { .. } => None,
    }
}

/// Applies an object command. Session commands are rejected.
pub(crate) fn apply(
    store: &mut ObjectStore,
    command: Command,
    now: DateTime<Utc>,
) -> ServerResult<Handled> {
    match command {
        Command::Create {
            kind,
            unique_name,
            ttl,
        } => {
            let snapshot = store.create(kind, unique_name, ttl, now)?;
            Ok(Handled::reply(Reply::Object(snapshot)))
        }
        Command::Open { kind, target } => {
            let snapshot = store.snapshot(kind, &target)?;
            Ok(Handled::reply(Reply::Object(snapshot)))
        }
        Command::UpdateDocument {
            target,
            data,
            if_revision,
            ttl,
        } => {
            let snapshot = store.update_document(&target, data, if_revision, ttl, now)?;
            Ok(Handled::with_push(
                Reply::Object(snapshot.clone()),
                Notification::ObjectUpdated(snapshot),
            ))
        }
        Command::SetTtl {
            kind,
            target,
            ttl,
            if_revision,
        } => {
            let snapshot = store.set_ttl(kind, &target, ttl, if_revision, now)?;
            Ok(Handled::with_push(
                Reply::Object(snapshot.clone()),
                Notification::ObjectUpdated(snapshot),
            ))
        }
        Command::Remove { kind, target } => {
            let sid = store.remove(kind, &target)?;
            Ok(Handled::with_push(
                Reply::Done,
                Notification::ObjectRemoved { sid, kind },
            ))
        }
        Command::GetItem {
            kind,
            target,
            item_id,
        } => {
            let item = store.get_item(kind, &target, &item_id)?;
            Ok(Handled::reply(Reply::Item {
                item,
                created: false,
            }))
        }
        Command::AddListItem { target, data, ttl } => {
            let item = store.add_list_item(&target, data, ttl, now)?;
            Ok(Handled::with_push(
                Reply::Item {
                    item: item.clone(),
                    created: true,
                },
                Notification::ItemAdded(item),
            ))
        }
        Command::SetItem {
            kind,
            target,
            item_id,
            data,
            if_revision,
            ttl,
        } => {
            let (item, created) =
                store.set_item(kind, &target, item_id, data, if_revision, ttl, now)?;
            let push = if created {
                Notification::ItemAdded(item.clone())
            } else {
                Notification::ItemUpdated(item.clone())
            };
            Ok(Handled::with_push(Reply::Item { item, created }, push))
        }
        Command::RemoveItem {
            kind,
            target,
            item_id,
        } => {
            let (collection_sid, revision) = store.remove_item(kind, &target, &item_id)?;
            Ok(Handled::with_push(
                Reply::Revision(revision),
                Notification::ItemRemoved {
                    collection_sid,
                    item_id,
                    revision,
                },
            ))
        }
        Command::QueryItems(query) => {
            let page = store.query(&query)?;
            Ok(Handled::reply(Reply::Items(page)))
        }
        Command::PublishMessage { target, data } => {
            let message = store.publish(&target, data)?;
            Ok(Handled::with_push(
                Reply::Message(message.clone()),
                Notification::MessagePublished(message),
            ))
        }
        Command::Subscribe { .. } | Command::Unsubscribe { .. } => Err(
            ServerError::InvalidRequest("subscriptions require a session".into()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use livesync_protocol::{ItemId, JsonObject};

    fn create(store: &mut ObjectStore, kind: ObjectKind) -> String {
        let handled = apply(
            store,
            Command::Create {
                kind,
                unique_name: None,
                ttl: None,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(handled.pushes.is_empty());
        handled.reply.into_object().unwrap().sid.into_inner()
    }

    #[test]
    fn writes_produce_pushes() {
        let mut store = ObjectStore::new(&ServerConfig::default());
        let sid = create(&mut store, ObjectKind::Map);

        let handled = apply(
            &mut store,
            Command::SetItem {
                kind: ObjectKind::Map,
                target: sid.clone(),
                item_id: "k".into(),
                data: JsonObject::new(),
                if_revision: None,
                ttl: None,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(handled.reply, Reply::Item { created: true, .. }));
        assert!(matches!(handled.pushes[..], [Notification::ItemAdded(_)]));

        let handled = apply(
            &mut store,
            Command::RemoveItem {
                kind: ObjectKind::Map,
                target: sid,
                item_id: ItemId::Key("k".into()),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(handled.reply, Reply::Revision(2)));
        assert!(matches!(
            handled.pushes[..],
            [Notification::ItemRemoved { revision: 2, .. }]
        ));
    }

    #[test]
    fn reads_do_not_push() {
        let mut store = ObjectStore::new(&ServerConfig::default());
        let sid = create(&mut store, ObjectKind::Document);
        let handled = apply(
            &mut store,
            Command::Open {
                kind: ObjectKind::Document,
                target: sid,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(handled.pushes.is_empty());
    }

    #[test]
    fn session_commands_rejected() {
        let mut store = ObjectStore::new(&ServerConfig::default());
        let result = apply(&mut store, Command::Unsubscribe { sids: vec![] }, Utc::now());
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn targets() {
        let command = Command::AddListItem {
            target: "feed".into(),
            data: JsonObject::new(),
            ttl: None,
        };
        assert_eq!(target_of(&command), Some((ObjectKind::List, "feed")));
        assert_eq!(target_of(&Command::Subscribe { requests: vec![] }), None);
    }
}
