//! Object cache and event fan-out.
//!
//! The cache holds one shared instance per SID for every object that has
//! at least one open handle. All pushes and mutation results are applied
//! here, under the dispatch gate, and every applied change is fanned out
//! to the object's listeners before the gate is released.

use crate::error::SyncError;
use crate::id::SyncObjectId;
use crate::listeners::ListenerRegistry;
use crate::subscription::{DispatchGate, SubscriptionObserver, SubscriptionState};
use livesync_protocol::{
    ItemId, ItemSnapshot, JsonObject, Notification, ObjectKind, ObjectSnapshot, Sid,
    StreamMessage,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// An event delivered to the listeners of an object.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    /// Metadata or document data changed.
    Updated(ObjectSnapshot),
    /// The object was removed. No further events follow.
    Removed(SyncObjectId),
    /// A collection item was added.
    ItemAdded(ItemSnapshot),
    /// A collection item was replaced.
    ItemUpdated(ItemSnapshot),
    /// A collection item was removed.
    ItemRemoved {
        /// The removed item.
        item_id: ItemId,
        /// Its last known state, if it was cached.
        previous: Option<ItemSnapshot>,
    },
    /// A message was published to a stream.
    MessagePublished(StreamMessage),
    /// The object's subscription changed state.
    SubscriptionStateChanged(SubscriptionState),
}

/// How an item state reached the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemChange {
    Added,
    Updated,
    Fetched,
}

#[derive(Debug, Clone)]
enum CachedItem {
    Live(ItemSnapshot),
    Removed { revision: u64 },
}

impl CachedItem {
    fn revision(&self) -> u64 {
        match self {
            CachedItem::Live(item) => item.revision,
            CachedItem::Removed { revision } => *revision,
        }
    }

    fn into_live(self) -> Option<ItemSnapshot> {
        match self {
            CachedItem::Live(item) => Some(item),
            CachedItem::Removed { .. } => None,
        }
    }
}

#[derive(Debug)]
struct ObjectState {
    snapshot: ObjectSnapshot,
    removed: bool,
    items: BTreeMap<ItemId, CachedItem>,
    /// Highest item revision seen in pushes. Replies never move it, so a
    /// resubscription replays everything pushed after it.
    item_revision: u64,
    /// Item revision the pending resubscription resumes after.
    resumed_from: Option<u64>,
}

/// State shared by every handle on one object.
#[derive(Debug)]
pub(crate) struct ObjectShared {
    id: SyncObjectId,
    kind: ObjectKind,
    state: RwLock<ObjectState>,
    pub(crate) listeners: ListenerRegistry<ObjectEvent>,
}

impl ObjectShared {
    fn new(snapshot: ObjectSnapshot) -> Self {
        Self {
            id: SyncObjectId::new(snapshot.sid.clone(), snapshot.unique_name.clone()),
            kind: snapshot.kind,
            state: RwLock::new(ObjectState {
                item_revision: snapshot.item_revision,
                snapshot,
                removed: false,
                items: BTreeMap::new(),
                resumed_from: None,
            }),
            listeners: ListenerRegistry::new(),
        }
    }

    pub(crate) fn id(&self) -> &SyncObjectId {
        &self.id
    }

    pub(crate) fn sid(&self) -> &Sid {
        self.id.sid()
    }

    pub(crate) fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub(crate) fn snapshot(&self) -> ObjectSnapshot {
        self.state.read().snapshot.clone()
    }

    pub(crate) fn revision(&self) -> u64 {
        self.state.read().snapshot.revision
    }

    pub(crate) fn data(&self) -> JsonObject {
        self.state.read().snapshot.data.clone().unwrap_or_default()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.read().removed
    }

    /// Revision to use as a precondition, or `None` once removed.
    pub(crate) fn precondition(&self) -> Option<u64> {
        let state = self.state.read();
        (!state.removed).then_some(state.snapshot.revision)
    }

    pub(crate) fn cached_item(&self, item_id: &ItemId) -> Option<ItemSnapshot> {
        match self.state.read().items.get(item_id) {
            Some(CachedItem::Live(item)) => Some(item.clone()),
            _ => None,
        }
    }

    /// Advances the pushed item revision. Caller holds the gate.
    fn note_pushed_item(&self, revision: u64) {
        let mut state = self.state.write();
        state.item_revision = state.item_revision.max(revision);
    }

    /// Records and returns the point a resubscription resumes after.
    fn begin_resume(&self) -> Option<u64> {
        if !self.kind.is_collection() {
            return None;
        }
        let mut state = self.state.write();
        if state.removed {
            return None;
        }
        let revision = state.item_revision;
        state.resumed_from = Some(revision);
        Some(revision)
    }

    /// Drops tombstones the authority will not replay again.
    ///
    /// Removals at or before the resume point were pushed on an earlier
    /// session and already dispatched.
    fn prune_tombstones(&self) {
        let mut state = self.state.write();
        let Some(floor) = state.resumed_from.take() else {
            return;
        };
        let before = state.items.len();
        state.items.retain(|_, item| {
            !matches!(item, CachedItem::Removed { revision } if *revision <= floor)
        });
        let pruned = before - state.items.len();
        if pruned > 0 {
            trace!(sid = %self.sid(), pruned, floor, "item tombstones pruned");
        }
    }

    /// Applies a newer snapshot. Caller holds the gate.
    fn apply_snapshot(&self, mut snapshot: ObjectSnapshot) -> bool {
        {
            let mut state = self.state.write();
            if state.removed || !snapshot.is_newer_than(state.snapshot.revision) {
                trace!(
                    sid = %self.sid(),
                    revision = snapshot.revision,
                    cached = state.snapshot.revision,
                    "discarding stale snapshot"
                );
                return false;
            }
            if snapshot.unique_name.is_none() {
                snapshot.unique_name = state.snapshot.unique_name.clone();
            }
            state.snapshot = snapshot.clone();
        }
        debug!(sid = %self.sid(), revision = snapshot.revision, "object updated");
        self.listeners.notify(&ObjectEvent::Updated(snapshot));
        true
    }

    /// Marks the object removed. Caller holds the gate.
    fn apply_removed(&self) -> bool {
        {
            let mut state = self.state.write();
            if state.removed {
                return false;
            }
            state.removed = true;
        }
        debug!(sid = %self.sid(), "object removed");
        self.listeners.notify(&ObjectEvent::Removed(self.id.clone()));
        true
    }

    /// Applies a newer item state. Caller holds the gate.
    fn apply_item(&self, item: ItemSnapshot, change: ItemChange) -> bool {
        let previous = {
            let mut state = self.state.write();
            if state.removed {
                return false;
            }
            if let Some(known) = state.items.get(&item.item_id) {
                if item.revision <= known.revision() {
                    trace!(
                        sid = %self.sid(),
                        item = %item.item_id,
                        revision = item.revision,
                        "discarding stale item"
                    );
                    return false;
                }
            }
            state
                .items
                .insert(item.item_id.clone(), CachedItem::Live(item.clone()))
        };
        let event = match (change, previous) {
            (ItemChange::Added, _) => ObjectEvent::ItemAdded(item),
            (ItemChange::Updated, _) => ObjectEvent::ItemUpdated(item),
            // First sighting through a read is not a change.
            (ItemChange::Fetched, None) => return true,
            (ItemChange::Fetched, Some(CachedItem::Live(_))) => ObjectEvent::ItemUpdated(item),
            (ItemChange::Fetched, Some(CachedItem::Removed { .. })) => {
                ObjectEvent::ItemAdded(item)
            }
        };
        self.listeners.notify(&event);
        true
    }

    /// Records an item removal. Caller holds the gate.
    fn apply_item_removed(&self, item_id: ItemId, revision: u64) -> bool {
        let previous = {
            let mut state = self.state.write();
            if state.removed {
                return false;
            }
            if let Some(known) = state.items.get(&item_id) {
                if revision <= known.revision() {
                    return false;
                }
            }
            state
                .items
                .insert(item_id.clone(), CachedItem::Removed { revision })
                .and_then(CachedItem::into_live)
        };
        self.listeners
            .notify(&ObjectEvent::ItemRemoved { item_id, previous });
        true
    }
}

#[derive(Default)]
struct CacheIndex {
    by_sid: HashMap<Sid, Weak<ObjectShared>>,
    by_name: HashMap<(ObjectKind, String), Sid>,
}

impl CacheIndex {
    fn get(&self, sid: &Sid) -> Option<Arc<ObjectShared>> {
        self.by_sid.get(sid).and_then(Weak::upgrade)
    }

    fn evict(&mut self, shared: &ObjectShared) {
        if let Some(existing) = self.by_sid.get(shared.sid()) {
            // Only evict the entry if it still points at this instance.
            if !std::ptr::eq(existing.as_ptr(), shared) {
                return;
            }
        }
        self.by_sid.remove(shared.sid());
        if let Some(name) = shared.id().unique_name() {
            let key = (shared.kind(), name.to_string());
            if self.by_name.get(&key) == Some(shared.sid()) {
                self.by_name.remove(&key);
            }
        }
    }
}

/// The per-client object cache.
pub(crate) struct ObjectCache {
    gate: DispatchGate,
    index: Mutex<CacheIndex>,
}

impl ObjectCache {
    pub(crate) fn new(gate: DispatchGate) -> Self {
        Self {
            gate,
            index: Mutex::new(CacheIndex::default()),
        }
    }

    /// Number of live cache entries.
    pub(crate) fn len(&self) -> usize {
        self.index
            .lock()
            .by_sid
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub(crate) fn get(&self, sid: &Sid) -> Option<Arc<ObjectShared>> {
        self.index.lock().get(sid)
    }

    /// Finds an open object by SID or unique name.
    pub(crate) fn lookup(&self, kind: ObjectKind, reference: &str) -> Option<Arc<ObjectShared>> {
        let index = self.index.lock();
        let by_sid = index.get(&Sid::new(reference));
        let shared = by_sid.or_else(|| {
            index
                .by_name
                .get(&(kind, reference.to_string()))
                .and_then(|sid| index.get(sid))
        })?;
        (shared.kind() == kind && !shared.is_removed()).then_some(shared)
    }

    /// Returns the shared instance for `snapshot.sid`, creating it if needed.
    ///
    /// An existing instance is brought forward to `snapshot` if it is newer.
    pub(crate) fn register(&self, snapshot: ObjectSnapshot) -> Arc<ObjectShared> {
        let _gate = self.gate.lock();
        let existing = self
            .index
            .lock()
            .get(&snapshot.sid)
            .filter(|shared| !shared.is_removed());
        if let Some(shared) = existing {
            shared.apply_snapshot(snapshot);
            return shared;
        }

        debug!(sid = %snapshot.sid, kind = %snapshot.kind, "cache entry created");
        let shared = Arc::new(ObjectShared::new(snapshot));
        let mut index = self.index.lock();
        index
            .by_sid
            .insert(shared.sid().clone(), Arc::downgrade(&shared));
        if let Some(name) = shared.id().unique_name() {
            index
                .by_name
                .insert((shared.kind(), name.to_string()), shared.sid().clone());
        }
        drop(index);
        shared
    }

    /// Drops the cache entry for `shared` once its last handle closed.
    pub(crate) fn evict(&self, shared: &ObjectShared) {
        self.index.lock().evict(shared);
        trace!(sid = %shared.sid(), "cache entry evicted");
    }

    /// Puts `shared` back in the index if it was evicted while a handle
    /// was being opened on it.
    pub(crate) fn adopt(&self, shared: &Arc<ObjectShared>) {
        if shared.is_removed() {
            return;
        }
        let mut index = self.index.lock();
        if index.get(shared.sid()).is_some() {
            return;
        }
        index
            .by_sid
            .insert(shared.sid().clone(), Arc::downgrade(shared));
        if let Some(name) = shared.id().unique_name() {
            index
                .by_name
                .insert((shared.kind(), name.to_string()), shared.sid().clone());
        }
        trace!(sid = %shared.sid(), "cache entry restored");
    }

    /// Applies a pushed change.
    pub(crate) fn apply_notification(&self, notification: Notification) {
        let _gate = self.gate.lock();
        let Some(shared) = self.get(notification.sid()) else {
            trace!(
                sid = %notification.sid(),
                event = notification.event_name(),
                "push for object not in cache"
            );
            return;
        };

        match notification {
            Notification::ObjectUpdated(snapshot) => {
                shared.apply_snapshot(snapshot);
            }
            Notification::ObjectRemoved { .. } => {
                self.remove(&shared);
            }
            Notification::ItemAdded(item) => {
                shared.note_pushed_item(item.revision);
                shared.apply_item(item, ItemChange::Added);
            }
            Notification::ItemUpdated(item) => {
                shared.note_pushed_item(item.revision);
                shared.apply_item(item, ItemChange::Updated);
            }
            Notification::ItemRemoved {
                item_id, revision, ..
            } => {
                shared.note_pushed_item(revision);
                shared.apply_item_removed(item_id, revision);
            }
            Notification::MessagePublished(message) => {
                if !shared.is_removed() {
                    shared
                        .listeners
                        .notify(&ObjectEvent::MessagePublished(message));
                }
            }
        }
    }

    /// Applies a snapshot obtained from a reply.
    pub(crate) fn apply_snapshot(&self, snapshot: ObjectSnapshot) -> bool {
        let _gate = self.gate.lock();
        match self.get(&snapshot.sid) {
            Some(shared) => shared.apply_snapshot(snapshot),
            None => false,
        }
    }

    /// Applies an item written by this client.
    pub(crate) fn apply_item(&self, item: ItemSnapshot, created: bool) -> bool {
        let change = if created {
            ItemChange::Added
        } else {
            ItemChange::Updated
        };
        self.apply_item_change(item, change)
    }

    /// Applies an item read from the authority.
    pub(crate) fn apply_fetched_item(&self, item: ItemSnapshot) -> bool {
        self.apply_item_change(item, ItemChange::Fetched)
    }

    fn apply_item_change(&self, item: ItemSnapshot, change: ItemChange) -> bool {
        let _gate = self.gate.lock();
        match self.get(&item.collection_sid) {
            Some(shared) => shared.apply_item(item, change),
            None => false,
        }
    }

    /// Records an item removal confirmed by a reply.
    pub(crate) fn apply_item_removed(&self, sid: &Sid, item_id: ItemId, revision: u64) -> bool {
        let _gate = self.gate.lock();
        match self.get(sid) {
            Some(shared) => shared.apply_item_removed(item_id, revision),
            None => false,
        }
    }

    /// Records an object removal confirmed by a reply.
    pub(crate) fn apply_removed(&self, sid: &Sid) -> bool {
        let _gate = self.gate.lock();
        match self.get(sid) {
            Some(shared) => self.remove(&shared),
            None => false,
        }
    }

    fn remove(&self, shared: &Arc<ObjectShared>) -> bool {
        let removed = shared.apply_removed();
        if removed {
            self.index.lock().evict(shared);
        }
        removed
    }
}

impl SubscriptionObserver for ObjectCache {
    fn on_subscription_state(&self, sid: &Sid, state: &SubscriptionState) {
        let Some(shared) = self.get(sid) else {
            return;
        };
        shared
            .listeners
            .notify(&ObjectEvent::SubscriptionStateChanged(state.clone()));
        match state {
            SubscriptionState::Established => shared.prune_tombstones(),
            // Removed while no pushes could reach us.
            SubscriptionState::Failed(SyncError::NotFound(_)) => {
                debug!(sid = %sid, "object gone on resubscribe");
                self.remove(&shared);
            }
            _ => {}
        }
    }

    fn resume_point(&self, sid: &Sid) -> Option<u64> {
        self.get(sid)?.begin_resume()
    }
}
