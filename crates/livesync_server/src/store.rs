//! In-memory object store.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, Utc};
use livesync_protocol::{
    ItemId, ItemSnapshot, ItemsPage, ItemsQuery, JsonObject, Notification, ObjectKind,
    ObjectSnapshot, PageToken, QueryOrder, Sid, StreamMessage,
};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;
use uuid::Uuid;

/// Prefix of stream message SIDs.
const MESSAGE_SID_PREFIX: &str = "TZ";

/// One stored object.
///
/// The object revision counts metadata and document changes. Collection
/// items carry their own revisions from a per-collection counter, so an
/// item removal gets a revision newer than any earlier write to it.
#[derive(Debug, Clone)]
struct StoredObject {
    sid: Sid,
    unique_name: Option<String>,
    kind: ObjectKind,
    revision: u64,
    date_created: DateTime<Utc>,
    date_updated: DateTime<Utc>,
    date_expires: Option<DateTime<Utc>>,
    data: JsonObject,
    items: BTreeMap<ItemId, StoredItem>,
    removed_items: BTreeMap<ItemId, RemovedItem>,
    next_index: u64,
    item_revision: u64,
}

#[derive(Debug, Clone)]
struct StoredItem {
    snapshot: ItemSnapshot,
    created_revision: u64,
}

/// Tombstone kept so resuming subscribers learn about removals.
#[derive(Debug, Clone, Copy)]
struct RemovedItem {
    created_revision: u64,
    revision: u64,
}

impl StoredObject {
    fn snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            sid: self.sid.clone(),
            unique_name: self.unique_name.clone(),
            kind: self.kind,
            revision: self.revision,
            date_created: self.date_created,
            date_updated: self.date_updated,
            date_expires: self.date_expires,
            data: (self.kind == ObjectKind::Document).then(|| self.data.clone()),
            item_revision: self.item_revision,
        }
    }

    fn check_revision(&self, if_revision: Option<u64>) -> ServerResult<()> {
        match if_revision {
            Some(expected) if expected != self.revision => Err(ServerError::PreconditionFailed {
                expected,
                actual: self.revision,
            }),
            _ => Ok(()),
        }
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.date_updated = now;
    }

    fn next_item_revision(&mut self) -> u64 {
        self.item_revision += 1;
        self.item_revision
    }

    fn put_item(&mut self, item: ItemSnapshot, created_revision: u64) {
        self.removed_items.remove(&item.item_id);
        self.items.insert(
            item.item_id.clone(),
            StoredItem {
                snapshot: item,
                created_revision,
            },
        );
    }

    /// Drops an item, returning the removal revision.
    fn take_item(&mut self, item_id: &ItemId) -> Option<u64> {
        let stored = self.items.remove(item_id)?;
        let revision = self.next_item_revision();
        self.removed_items.insert(
            item_id.clone(),
            RemovedItem {
                created_revision: stored.created_revision,
                revision,
            },
        );
        Some(revision)
    }
}

/// The authority's object state.
///
/// Every operation takes the current time explicitly so expiry can be
/// driven deterministically.
#[derive(Debug)]
pub struct ObjectStore {
    max_ttl: Duration,
    max_payload_bytes: usize,
    max_page_size: u32,
    objects: HashMap<Sid, StoredObject>,
    names: HashMap<(ObjectKind, String), Sid>,
}

impl ObjectStore {
    /// Creates an empty store with the limits from `config`.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            max_ttl: config.max_ttl,
            max_payload_bytes: config.max_payload_bytes,
            max_page_size: config.max_page_size.max(1),
            objects: HashMap::new(),
            names: HashMap::new(),
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Resolves a SID or unique name to the SID of an object of `kind`.
    pub fn resolve(&self, kind: ObjectKind, reference: &str) -> ServerResult<Sid> {
        let by_sid = Sid::new(reference);
        if let Some(object) = self.objects.get(&by_sid) {
            if object.kind == kind {
                return Ok(by_sid);
            }
        }
        self.names
            .get(&(kind, reference.to_string()))
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("{kind} {reference}")))
    }

    fn get(&self, kind: ObjectKind, reference: &str) -> ServerResult<&StoredObject> {
        let sid = self.resolve(kind, reference)?;
        self.objects
            .get(&sid)
            .ok_or_else(|| ServerError::Internal(format!("name index points at missing {sid}")))
    }

    fn get_mut(&mut self, kind: ObjectKind, reference: &str) -> ServerResult<&mut StoredObject> {
        let sid = self.resolve(kind, reference)?;
        self.objects
            .get_mut(&sid)
            .ok_or_else(|| ServerError::Internal(format!("name index points at missing {sid}")))
    }

    fn collection_mut(
        &mut self,
        kind: ObjectKind,
        reference: &str,
        item_id: &ItemId,
    ) -> ServerResult<&mut StoredObject> {
        if !kind.is_collection() {
            return Err(ServerError::InvalidRequest(format!("{kind} has no items")));
        }
        if item_id.collection_kind() != kind {
            return Err(ServerError::InvalidRequest(format!(
                "item id {item_id} does not address a {kind}"
            )));
        }
        self.get_mut(kind, reference)
    }

    fn expiry(&self, ttl: Duration, now: DateTime<Utc>) -> ServerResult<Option<DateTime<Utc>>> {
        if ttl > self.max_ttl {
            return Err(ServerError::InvalidRequest(format!(
                "ttl of {}s exceeds the maximum of {}s",
                ttl.as_secs(),
                self.max_ttl.as_secs()
            )));
        }
        if ttl.is_zero() {
            return Ok(None);
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ServerError::InvalidRequest(format!("ttl out of range: {e}")))?;
        Ok(Some(now + ttl))
    }

    fn check_payload(&self, data: &JsonObject) -> ServerResult<()> {
        let size = serde_json::to_vec(data)
            .map_err(|e| ServerError::Internal(format!("payload encoding failed: {e}")))?
            .len();
        if size > self.max_payload_bytes {
            return Err(ServerError::InvalidRequest(format!(
                "payload of {size} bytes exceeds the limit of {} bytes",
                self.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Creates an object.
    pub fn create(
        &mut self,
        kind: ObjectKind,
        unique_name: Option<String>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ServerResult<ObjectSnapshot> {
        if let Some(name) = &unique_name {
            if name.is_empty() {
                return Err(ServerError::InvalidRequest("empty unique name".into()));
            }
            if Sid::looks_like(name, kind) {
                return Err(ServerError::InvalidRequest(format!(
                    "unique name {name} looks like a {kind} SID"
                )));
            }
            if self.names.contains_key(&(kind, name.clone())) {
                return Err(ServerError::NameAlreadyExists(name.clone()));
            }
        }
        let date_expires = match ttl {
            Some(ttl) => self.expiry(ttl, now)?,
            None => None,
        };

        let sid = Sid::new(format!("{}{}", kind.sid_prefix(), Uuid::new_v4().simple()));
        let object = StoredObject {
            sid: sid.clone(),
            unique_name: unique_name.clone(),
            kind,
            revision: 1,
            date_created: now,
            date_updated: now,
            date_expires,
            data: JsonObject::new(),
            items: BTreeMap::new(),
            removed_items: BTreeMap::new(),
            next_index: 0,
            item_revision: 0,
        };
        let snapshot = object.snapshot();
        if let Some(name) = unique_name {
            self.names.insert((kind, name), sid.clone());
        }
        self.objects.insert(sid, object);
        Ok(snapshot)
    }

    /// Returns an object's current snapshot.
    pub fn snapshot(&self, kind: ObjectKind, reference: &str) -> ServerResult<ObjectSnapshot> {
        self.get(kind, reference).map(StoredObject::snapshot)
    }

    /// Replaces a document's data.
    pub fn update_document(
        &mut self,
        reference: &str,
        data: JsonObject,
        if_revision: Option<u64>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ServerResult<ObjectSnapshot> {
        self.check_payload(&data)?;
        let date_expires = ttl.map(|ttl| self.expiry(ttl, now)).transpose()?;
        let object = self.get_mut(ObjectKind::Document, reference)?;
        object.check_revision(if_revision)?;
        object.data = data;
        if let Some(date_expires) = date_expires {
            object.date_expires = date_expires;
        }
        object.bump(now);
        Ok(object.snapshot())
    }

    /// Changes an object's TTL. Zero clears the expiration.
    pub fn set_ttl(
        &mut self,
        kind: ObjectKind,
        reference: &str,
        ttl: Duration,
        if_revision: Option<u64>,
        now: DateTime<Utc>,
    ) -> ServerResult<ObjectSnapshot> {
        let date_expires = self.expiry(ttl, now)?;
        let object = self.get_mut(kind, reference)?;
        object.check_revision(if_revision)?;
        object.date_expires = date_expires;
        object.bump(now);
        Ok(object.snapshot())
    }

    /// Removes an object, returning its SID.
    pub fn remove(&mut self, kind: ObjectKind, reference: &str) -> ServerResult<Sid> {
        let sid = self.resolve(kind, reference)?;
        self.remove_sid(&sid)
            .ok_or_else(|| ServerError::Internal(format!("name index points at missing {sid}")))?;
        Ok(sid)
    }

    fn remove_sid(&mut self, sid: &Sid) -> Option<StoredObject> {
        let object = self.objects.remove(sid)?;
        if let Some(name) = &object.unique_name {
            self.names.remove(&(object.kind, name.clone()));
        }
        Some(object)
    }

    /// Fetches one item.
    pub fn get_item(
        &self,
        kind: ObjectKind,
        reference: &str,
        item_id: &ItemId,
    ) -> ServerResult<ItemSnapshot> {
        let object = self.get(kind, reference)?;
        object
            .items
            .get(item_id)
            .map(|stored| stored.snapshot.clone())
            .ok_or_else(|| ServerError::NotFound(format!("item {item_id} in {}", object.sid)))
    }

    /// Appends a list item at the next unused index.
    pub fn add_list_item(
        &mut self,
        reference: &str,
        data: JsonObject,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ServerResult<ItemSnapshot> {
        self.check_payload(&data)?;
        let date_expires = ttl.map(|ttl| self.expiry(ttl, now)).transpose()?.flatten();
        let list = self.get_mut(ObjectKind::List, reference)?;
        let item_id = ItemId::Index(list.next_index);
        list.next_index += 1;
        let revision = list.next_item_revision();
        let item = ItemSnapshot {
            collection_sid: list.sid.clone(),
            item_id,
            data,
            revision,
            date_created: now,
            date_updated: now,
            date_expires,
        };
        list.put_item(item.clone(), revision);
        Ok(item)
    }

    /// Writes an item. Maps create missing keys; lists only replace.
    ///
    /// Returns the item and whether it was created.
    #[allow(clippy::too_many_arguments)]
    pub fn set_item(
        &mut self,
        kind: ObjectKind,
        reference: &str,
        item_id: ItemId,
        data: JsonObject,
        if_revision: Option<u64>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ServerResult<(ItemSnapshot, bool)> {
        self.check_payload(&data)?;
        let date_expires = ttl.map(|ttl| self.expiry(ttl, now)).transpose()?;
        let collection = self.collection_mut(kind, reference, &item_id)?;

        let existing = collection.items.get(&item_id);
        match (existing.map(|stored| &stored.snapshot), if_revision) {
            (Some(item), Some(expected)) if item.revision != expected => {
                return Err(ServerError::PreconditionFailed {
                    expected,
                    actual: item.revision,
                });
            }
            (None, _) if kind == ObjectKind::List => {
                return Err(ServerError::NotFound(format!(
                    "item {item_id} in {}",
                    collection.sid
                )));
            }
            (None, Some(expected)) if expected != 0 => {
                return Err(ServerError::PreconditionFailed {
                    expected,
                    actual: 0,
                });
            }
            _ => {}
        }

        let created = existing.is_none();
        let previous = existing.map(|stored| {
            (
                stored.snapshot.date_created,
                stored.snapshot.date_expires,
                stored.created_revision,
            )
        });
        let revision = collection.next_item_revision();
        let (date_created, previous_expiry, created_revision) =
            previous.unwrap_or((now, None, revision));
        let item = ItemSnapshot {
            collection_sid: collection.sid.clone(),
            item_id,
            data,
            revision,
            date_created,
            date_updated: now,
            date_expires: date_expires.unwrap_or(previous_expiry),
        };
        collection.put_item(item.clone(), created_revision);
        Ok((item, created))
    }

    /// Removes an item, returning the collection SID and removal revision.
    pub fn remove_item(
        &mut self,
        kind: ObjectKind,
        reference: &str,
        item_id: &ItemId,
    ) -> ServerResult<(Sid, u64)> {
        let collection = self.collection_mut(kind, reference, item_id)?;
        match collection.take_item(item_id) {
            Some(revision) => Ok((collection.sid.clone(), revision)),
            None => Err(ServerError::NotFound(format!(
                "item {item_id} in {}",
                collection.sid
            ))),
        }
    }

    /// Item pushes newer than `since`, in revision order.
    ///
    /// Items created after `since` replay as additions, older ones as
    /// updates. Items both created and removed after `since` are skipped.
    pub fn item_changes_since(
        &self,
        kind: ObjectKind,
        reference: &str,
        since: u64,
    ) -> ServerResult<Vec<Notification>> {
        if !kind.is_collection() {
            return Ok(Vec::new());
        }
        let collection = self.get(kind, reference)?;
        let mut changes: Vec<(u64, Notification)> = collection
            .items
            .values()
            .filter(|stored| stored.snapshot.revision > since)
            .map(|stored| {
                let push = if stored.created_revision > since {
                    Notification::ItemAdded(stored.snapshot.clone())
                } else {
                    Notification::ItemUpdated(stored.snapshot.clone())
                };
                (stored.snapshot.revision, push)
            })
            .collect();
        changes.extend(
            collection
                .removed_items
                .iter()
                .filter(|(_, removed)| {
                    removed.revision > since && removed.created_revision <= since
                })
                .map(|(item_id, removed)| {
                    (
                        removed.revision,
                        Notification::ItemRemoved {
                            collection_sid: collection.sid.clone(),
                            item_id: item_id.clone(),
                            revision: removed.revision,
                        },
                    )
                }),
        );
        changes.sort_by_key(|(revision, _)| *revision);
        Ok(changes.into_iter().map(|(_, push)| push).collect())
    }

    /// Returns one page of a collection's items.
    pub fn query(&self, query: &ItemsQuery) -> ServerResult<ItemsPage> {
        if !query.kind.is_collection() {
            return Err(ServerError::InvalidRequest(format!(
                "{} has no items",
                query.kind
            )));
        }
        let collection = self.get(query.kind, &query.target)?;

        let bound = match (&query.page_token, &query.from) {
            (Some(token), _) => Bound::Excluded(token.resume_after()?),
            (None, Some(from)) if query.include_from => Bound::Included(from.clone()),
            (None, Some(from)) => Bound::Excluded(from.clone()),
            (None, None) => Bound::Unbounded,
        };
        if let Bound::Included(id) | Bound::Excluded(id) = &bound {
            if id.collection_kind() != query.kind {
                return Err(ServerError::InvalidRequest(format!(
                    "item id {id} does not address a {}",
                    query.kind
                )));
            }
        }

        let page_size = query.page_size.clamp(1, self.max_page_size) as usize;
        let mut items: Vec<ItemSnapshot> = match query.order {
            QueryOrder::Ascending => collection
                .items
                .range((bound, Bound::Unbounded))
                .map(|(_, stored)| stored.snapshot.clone())
                .take(page_size + 1)
                .collect(),
            QueryOrder::Descending => collection
                .items
                .range((Bound::Unbounded, bound))
                .rev()
                .map(|(_, stored)| stored.snapshot.clone())
                .take(page_size + 1)
                .collect(),
        };

        let more = items.len() > page_size;
        items.truncate(page_size);
        let next_page = match items.last() {
            Some(last) if more => Some(PageToken::after(&last.item_id)),
            _ => None,
        };
        Ok(ItemsPage { items, next_page })
    }

    /// Builds a stream message. Messages are not stored.
    pub fn publish(&self, reference: &str, data: JsonObject) -> ServerResult<StreamMessage> {
        self.check_payload(&data)?;
        let stream = self.get(ObjectKind::Stream, reference)?;
        Ok(StreamMessage {
            sid: Sid::new(format!("{MESSAGE_SID_PREFIX}{}", Uuid::new_v4().simple())),
            stream_sid: stream.sid.clone(),
            data,
        })
    }

    /// Removes every object and item whose expiry is at or before `now`,
    /// returning the resulting pushes.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let due = |expires: Option<DateTime<Utc>>| expires.is_some_and(|at| at <= now);
        let mut pushes = Vec::new();

        let expired: Vec<Sid> = self
            .objects
            .values()
            .filter(|o| due(o.date_expires))
            .map(|o| o.sid.clone())
            .collect();
        for sid in expired {
            if let Some(object) = self.remove_sid(&sid) {
                pushes.push(Notification::ObjectRemoved {
                    sid,
                    kind: object.kind,
                });
            }
        }

        for collection in self.objects.values_mut() {
            let expired: Vec<ItemId> = collection
                .items
                .values()
                .filter(|stored| due(stored.snapshot.date_expires))
                .map(|stored| stored.snapshot.item_id.clone())
                .collect();
            for item_id in expired {
                let Some(revision) = collection.take_item(&item_id) else {
                    continue;
                };
                pushes.push(Notification::ItemRemoved {
                    collection_sid: collection.sid.clone(),
                    item_id,
                    revision,
                });
            }
        }
        pushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ObjectStore {
        ObjectStore::new(&ServerConfig::default())
    }

    fn data(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_and_resolve() {
        let mut store = store();
        let now = Utc::now();
        let doc = store
            .create(ObjectKind::Document, Some("settings".into()), None, now)
            .unwrap();
        assert!(doc.sid.as_str().starts_with("ET"));
        assert_eq!(doc.revision, 1);
        assert_eq!(doc.data, Some(JsonObject::new()));

        assert_eq!(store.resolve(ObjectKind::Document, "settings").unwrap(), doc.sid);
        assert_eq!(
            store.resolve(ObjectKind::Document, doc.sid.as_str()).unwrap(),
            doc.sid
        );
        // Names are scoped by kind.
        assert!(store.resolve(ObjectKind::Map, "settings").is_err());
        assert!(store.resolve(ObjectKind::Map, doc.sid.as_str()).is_err());
    }

    #[test]
    fn unique_names_are_unique() {
        let mut store = store();
        let now = Utc::now();
        store
            .create(ObjectKind::List, Some("feed".into()), None, now)
            .unwrap();
        assert_eq!(
            store.create(ObjectKind::List, Some("feed".into()), None, now),
            Err(ServerError::NameAlreadyExists("feed".into()))
        );
        assert!(store
            .create(ObjectKind::Map, Some("feed".into()), None, now)
            .is_ok());
    }

    #[test]
    fn conditional_update() {
        let mut store = store();
        let now = Utc::now();
        let doc = store.create(ObjectKind::Document, None, None, now).unwrap();

        let updated = store
            .update_document(doc.sid.as_str(), data(json!({"a": 1})), Some(1), None, now)
            .unwrap();
        assert_eq!(updated.revision, 2);

        let stale = store.update_document(doc.sid.as_str(), data(json!({"a": 2})), Some(1), None, now);
        assert_eq!(
            stale,
            Err(ServerError::PreconditionFailed {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn ttl_set_and_clear() {
        let mut store = store();
        let now = Utc::now();
        let doc = store
            .create(ObjectKind::Document, None, Some(Duration::from_secs(3600)), now)
            .unwrap();
        assert_eq!(doc.date_expires, Some(now + chrono::Duration::seconds(3600)));

        let cleared = store
            .set_ttl(ObjectKind::Document, doc.sid.as_str(), Duration::ZERO, None, now)
            .unwrap();
        assert_eq!(cleared.date_expires, None);
        assert_eq!(cleared.revision, 2);

        let too_long = store.set_ttl(
            ObjectKind::Document,
            doc.sid.as_str(),
            Duration::from_secs(u64::MAX / 4),
            None,
            now,
        );
        assert!(matches!(too_long, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn list_indices_are_never_reused() {
        let mut store = store();
        let now = Utc::now();
        let list = store.create(ObjectKind::List, None, None, now).unwrap();
        let sid = list.sid.as_str();

        let first = store.add_list_item(sid, data(json!({"n": 0})), None, now).unwrap();
        let second = store.add_list_item(sid, data(json!({"n": 1})), None, now).unwrap();
        assert_eq!(first.index(), Some(0));
        assert_eq!(second.index(), Some(1));

        let (_, removal) = store.remove_item(ObjectKind::List, sid, &ItemId::Index(1)).unwrap();
        assert!(removal > second.revision);

        let third = store.add_list_item(sid, data(json!({"n": 2})), None, now).unwrap();
        assert_eq!(third.index(), Some(2));

        // Lists never create by index.
        let missing = store.set_item(
            ObjectKind::List,
            sid,
            ItemId::Index(1),
            JsonObject::new(),
            None,
            None,
            now,
        );
        assert!(matches!(missing, Err(ServerError::NotFound(_))));
    }

    #[test]
    fn map_item_preconditions() {
        let mut store = store();
        let now = Utc::now();
        let map = store.create(ObjectKind::Map, None, None, now).unwrap();
        let sid = map.sid.as_str();

        let (created, was_created) = store
            .set_item(ObjectKind::Map, sid, "k".into(), data(json!({"v": 1})), Some(0), None, now)
            .unwrap();
        assert!(was_created);

        // Revision 0 requires absence.
        let again = store.set_item(ObjectKind::Map, sid, "k".into(), JsonObject::new(), Some(0), None, now);
        assert!(matches!(again, Err(ServerError::PreconditionFailed { expected: 0, .. })));

        let (updated, was_created) = store
            .set_item(
                ObjectKind::Map,
                sid,
                "k".into(),
                data(json!({"v": 2})),
                Some(created.revision),
                None,
                now,
            )
            .unwrap();
        assert!(!was_created);
        assert!(updated.revision > created.revision);
        assert_eq!(updated.date_created, created.date_created);

        let wrong_kind = store.set_item(ObjectKind::Map, sid, ItemId::Index(0), JsonObject::new(), None, None, now);
        assert!(matches!(wrong_kind, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn paging_in_both_orders() {
        let mut store = store();
        let now = Utc::now();
        let list = store.create(ObjectKind::List, None, None, now).unwrap();
        for n in 0..5 {
            store
                .add_list_item(list.sid.as_str(), data(json!({ "n": n })), None, now)
                .unwrap();
        }

        let mut query = ItemsQuery {
            kind: ObjectKind::List,
            target: list.sid.to_string(),
            from: None,
            include_from: false,
            order: QueryOrder::Ascending,
            page_size: 2,
            page_token: None,
        };
        let mut seen = Vec::new();
        loop {
            let page = store.query(&query).unwrap();
            seen.extend(page.items.iter().filter_map(ItemSnapshot::index));
            match page.next_page {
                Some(token) => query.page_token = Some(token),
                None => break,
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let descending = ItemsQuery {
            order: QueryOrder::Descending,
            from: Some(ItemId::Index(3)),
            include_from: true,
            page_size: 10,
            page_token: None,
            ..query
        };
        let page = store.query(&descending).unwrap();
        let indices: Vec<u64> = page.items.iter().filter_map(ItemSnapshot::index).collect();
        assert_eq!(indices, vec![3, 2, 1, 0]);
        assert!(page.next_page.is_none());
    }

    #[test]
    fn payload_limit() {
        let mut store = ObjectStore::new(&ServerConfig::new().with_max_payload_bytes(16));
        let now = Utc::now();
        let doc = store.create(ObjectKind::Document, None, None, now).unwrap();
        let big = data(json!({"text": "x".repeat(64)}));
        assert!(matches!(
            store.update_document(doc.sid.as_str(), big, None, None, now),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn expiry_removes_objects_and_items() {
        let mut store = store();
        let now = Utc::now();
        let doc = store
            .create(ObjectKind::Document, Some("temp".into()), Some(Duration::from_secs(10)), now)
            .unwrap();
        let map = store.create(ObjectKind::Map, None, None, now).unwrap();
        store
            .set_item(
                ObjectKind::Map,
                map.sid.as_str(),
                "short".into(),
                JsonObject::new(),
                None,
                Some(Duration::from_secs(5)),
                now,
            )
            .unwrap();

        assert!(store.expire_due(now).is_empty());

        let pushes = store.expire_due(now + chrono::Duration::seconds(10));
        assert_eq!(pushes.len(), 2);
        assert!(pushes.contains(&Notification::ObjectRemoved {
            sid: doc.sid.clone(),
            kind: ObjectKind::Document
        }));
        assert!(store.resolve(ObjectKind::Document, "temp").is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn item_changes_replay_from_a_revision() {
        let mut store = store();
        let now = Utc::now();
        let map = store.create(ObjectKind::Map, None, None, now).unwrap();
        let sid = map.sid.as_str();
        let put = |store: &mut ObjectStore, key: &str| {
            store
                .set_item(ObjectKind::Map, sid, key.into(), JsonObject::new(), None, None, now)
                .unwrap()
                .0
                .revision
        };
        let remove = |store: &mut ObjectStore, key: &str| {
            store
                .remove_item(ObjectKind::Map, sid, &ItemId::Key(key.into()))
                .unwrap()
                .1
        };

        put(&mut store, "kept");
        put(&mut store, "changed");
        put(&mut store, "dropped");
        let since = store.snapshot(ObjectKind::Map, sid).unwrap().item_revision;
        assert_eq!(since, 3);

        assert_eq!(put(&mut store, "changed"), 4);
        assert_eq!(remove(&mut store, "dropped"), 5);
        assert_eq!(put(&mut store, "fresh"), 6);
        // Created and removed while away: nothing to replay.
        put(&mut store, "fleeting");
        remove(&mut store, "fleeting");

        let changes = store.item_changes_since(ObjectKind::Map, sid, since).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(matches!(
            &changes[0],
            Notification::ItemUpdated(i) if i.key() == Some("changed") && i.revision == 4
        ));
        assert!(matches!(
            &changes[1],
            Notification::ItemRemoved { revision: 5, .. }
        ));
        assert!(matches!(
            &changes[2],
            Notification::ItemAdded(i) if i.key() == Some("fresh")
        ));
        assert!(store
            .item_changes_since(ObjectKind::Map, sid, 8)
            .unwrap()
            .is_empty());

        // A re-added key replays as an addition.
        put(&mut store, "dropped");
        let changes = store.item_changes_since(ObjectKind::Map, sid, 8).unwrap();
        assert!(matches!(
            changes.as_slice(),
            [Notification::ItemAdded(i)] if i.key() == Some("dropped")
        ));
    }

    #[test]
    fn publish_targets_streams_only() {
        let mut store = store();
        let now = Utc::now();
        let stream = store.create(ObjectKind::Stream, Some("chat".into()), None, now).unwrap();
        let message = store.publish("chat", data(json!({"text": "hi"}))).unwrap();
        assert_eq!(message.stream_sid, stream.sid);
        assert!(message.sid.as_str().starts_with("TZ"));
        assert!(store.publish("nope", JsonObject::new()).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum ListOp {
            Add,
            Remove(usize),
            Set(usize),
        }

        fn list_op() -> impl Strategy<Value = ListOp> {
            prop_oneof![
                3 => Just(ListOp::Add),
                1 => any::<usize>().prop_map(ListOp::Remove),
                1 => any::<usize>().prop_map(ListOp::Set),
            ]
        }

        proptest! {
            #[test]
            fn list_indices_and_revisions_only_grow(ops in prop::collection::vec(list_op(), 1..60)) {
                let mut store = store();
                let now = Utc::now();
                store.create(ObjectKind::List, Some("l".into()), None, now).unwrap();

                let mut last_index = None;
                let mut last_revision = 0;
                for op in ops {
                    let live: Vec<ItemId> = store.get(ObjectKind::List, "l").unwrap().items.keys().cloned().collect();
                    let revision = match op {
                        ListOp::Add => {
                            let item = store.add_list_item("l", JsonObject::new(), None, now).unwrap();
                            let index = item.index().unwrap();
                            prop_assert!(last_index.map_or(true, |last| index > last));
                            last_index = Some(index);
                            item.revision
                        }
                        ListOp::Remove(pick) if !live.is_empty() => {
                            let id = &live[pick % live.len()];
                            store.remove_item(ObjectKind::List, "l", id).unwrap().1
                        }
                        ListOp::Set(pick) if !live.is_empty() => {
                            let id = live[pick % live.len()].clone();
                            store
                                .set_item(ObjectKind::List, "l", id, JsonObject::new(), None, None, now)
                                .unwrap()
                                .0
                                .revision
                        }
                        _ => continue,
                    };
                    prop_assert!(revision > last_revision);
                    last_revision = revision;
                }
            }
        }
    }
}
