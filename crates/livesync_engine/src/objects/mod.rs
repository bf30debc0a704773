//! Object handles and per-kind facades.
//!
//! A handle is a counted reference to one cached object. Every handle on
//! the same SID shares one state and one listener set, and holds one
//! reference on the object's subscription. Listeners registered through a
//! handle are removed when that handle is closed or dropped.
//!
//! Handles and facades are generic over a kind marker, with aliases for
//! each kind:
//!
//! ```ignore
//! let doc: Document = client.documents().open_or_create("settings", None).await?;
//! doc.on_updated(|snapshot| println!("now at r{}", snapshot.revision));
//! doc.mutate_data(|mut data| {
//!     data.insert("theme".into(), "dark".into());
//!     Some(data)
//! })
//! .await?;
//! ```

mod document;
mod list;
mod map;
mod stream;

use crate::cache::{ObjectEvent, ObjectShared};
use crate::client::ClientInner;
use crate::error::{SyncError, SyncResult};
use crate::id::SyncObjectId;
use crate::listeners::ListenerId;
use crate::mutator::Target;
use crate::subscription::SubscriptionState;
use chrono::{DateTime, Utc};
use livesync_protocol::{ObjectKind, ObjectSnapshot, Sid};
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

mod sealed {
    pub trait Sealed {}
}

/// Marker for the kind of object a handle or facade works with.
pub trait ObjectType: sealed::Sealed + Send + Sync + 'static {
    /// The protocol kind.
    const KIND: ObjectKind;
}

/// Marker for documents.
#[derive(Debug)]
pub enum DocumentKind {}

/// Marker for lists.
#[derive(Debug)]
pub enum ListKind {}

/// Marker for maps.
#[derive(Debug)]
pub enum MapKind {}

/// Marker for streams.
#[derive(Debug)]
pub enum StreamKind {}

impl sealed::Sealed for DocumentKind {}
impl sealed::Sealed for ListKind {}
impl sealed::Sealed for MapKind {}
impl sealed::Sealed for StreamKind {}

impl ObjectType for DocumentKind {
    const KIND: ObjectKind = ObjectKind::Document;
}

impl ObjectType for ListKind {
    const KIND: ObjectKind = ObjectKind::List;
}

impl ObjectType for MapKind {
    const KIND: ObjectKind = ObjectKind::Map;
}

impl ObjectType for StreamKind {
    const KIND: ObjectKind = ObjectKind::Stream;
}

/// A handle on a document.
pub type Document = SyncObject<DocumentKind>;
/// A handle on a list.
pub type List = SyncObject<ListKind>;
/// A handle on a map.
pub type Map = SyncObject<MapKind>;
/// A handle on a stream.
pub type Stream = SyncObject<StreamKind>;

/// Document operations by SID or unique name.
pub type Documents = Objects<DocumentKind>;
/// List operations by SID or unique name.
pub type Lists = Objects<ListKind>;
/// Map operations by SID or unique name.
pub type Maps = Objects<MapKind>;
/// Stream operations by SID or unique name.
pub type Streams = Objects<StreamKind>;

/// An open handle on a shared object.
///
/// Cloning a handle opens another handle on the same object, with its own
/// listener set.
pub struct SyncObject<K: ObjectType> {
    client: Arc<ClientInner>,
    shared: Arc<ObjectShared>,
    own_listeners: Mutex<Vec<ListenerId>>,
    closed: AtomicBool,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ObjectType> SyncObject<K> {
    pub(crate) fn new(client: Arc<ClientInner>, shared: Arc<ObjectShared>) -> Self {
        {
            let _gate = client.gate.lock();
            client.subscriptions.acquire(shared.sid(), shared.kind());
            client.cache.adopt(&shared);
        }
        Self {
            client,
            shared,
            own_listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            _kind: PhantomData,
        }
    }

    /// Target for mutations, failing once the handle is closed.
    pub(crate) fn target(&self) -> SyncResult<Target> {
        if self.is_closed() {
            return Err(SyncError::InvalidArgument(format!(
                "handle on {} is closed",
                self.sid()
            )));
        }
        self.client.ensure_running()?;
        Ok(Target::open(&self.shared))
    }

    /// Registers `callback` on the shared listener set, owned by this handle.
    pub(crate) fn listen<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ObjectEvent) + Send + Sync + 'static,
    {
        let id = self.shared.listeners.add(callback);
        self.own_listeners.lock().push(id);
        id
    }

    /// The object's identity.
    pub fn id(&self) -> &SyncObjectId {
        self.shared.id()
    }

    /// The object's SID.
    pub fn sid(&self) -> &Sid {
        self.shared.sid()
    }

    /// The object's unique name, if it has one.
    pub fn unique_name(&self) -> Option<&str> {
        self.shared.id().unique_name()
    }

    /// The object's kind.
    pub fn kind(&self) -> ObjectKind {
        K::KIND
    }

    /// The last known metadata (and data, for documents).
    pub fn snapshot(&self) -> ObjectSnapshot {
        self.shared.snapshot()
    }

    /// The last known revision.
    pub fn revision(&self) -> u64 {
        self.shared.revision()
    }

    /// When the object was created.
    pub fn date_created(&self) -> DateTime<Utc> {
        self.shared.snapshot().date_created
    }

    /// When the object last changed.
    pub fn date_updated(&self) -> DateTime<Utc> {
        self.shared.snapshot().date_updated
    }

    /// When the authority will expire the object, if a TTL is set.
    pub fn date_expires(&self) -> Option<DateTime<Utc>> {
        self.shared.snapshot().date_expires
    }

    /// Returns true once the object has been removed. Never reverts.
    pub fn is_removed(&self) -> bool {
        self.shared.is_removed()
    }

    /// Returns true once this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current state of the object's subscription.
    pub fn subscription_state(&self) -> SubscriptionState {
        self.client.subscriptions.state(self.sid())
    }

    /// Waits until pushes for this object are being delivered.
    pub async fn wait_established(&self) -> SyncResult<()> {
        self.target()?;
        self.client.subscriptions.wait_established(self.sid()).await
    }

    /// Sets the object's TTL. A zero TTL clears the expiration.
    pub async fn set_ttl(&self, ttl: Duration) -> SyncResult<ObjectSnapshot> {
        let target = self.target()?;
        self.client.mutator().set_ttl(&target, ttl).await
    }

    /// Removes the object at the authority.
    pub async fn remove(&self) -> SyncResult<()> {
        let target = self.target()?;
        self.client.mutator().remove(&target).await
    }

    /// Listens for metadata and data changes.
    pub fn on_updated<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ObjectSnapshot) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::Updated(snapshot) = event {
                callback(snapshot);
            }
        })
    }

    /// Listens for the object's removal.
    pub fn on_removed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SyncObjectId) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::Removed(id) = event {
                callback(id);
            }
        })
    }

    /// Listens for subscription state transitions.
    pub fn on_subscription_state_changed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SubscriptionState) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::SubscriptionStateChanged(state) = event {
                callback(state);
            }
        })
    }

    /// Listens for every event on the object.
    pub fn add_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ObjectEvent) + Send + Sync + 'static,
    {
        self.listen(callback)
    }

    /// Removes a listener registered through this handle.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut own = self.own_listeners.lock();
        match own.iter().position(|l| *l == id) {
            Some(pos) => {
                own.swap_remove(pos);
                drop(own);
                self.shared.listeners.remove(id)
            }
            None => false,
        }
    }

    /// Closes the handle, removing its listeners and releasing its
    /// subscription. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let own: Vec<ListenerId> = self.own_listeners.lock().drain(..).collect();
        for id in own {
            self.shared.listeners.remove(id);
        }
        let _gate = self.client.gate.lock();
        if self.client.subscriptions.release(self.sid()) {
            self.client.cache.evict(&self.shared);
        }
        debug!(sid = %self.sid(), "handle closed");
    }
}

impl<K: ObjectType> Clone for SyncObject<K> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.client), Arc::clone(&self.shared))
    }
}

impl<K: ObjectType> Drop for SyncObject<K> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K: ObjectType> fmt::Debug for SyncObject<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncObject")
            .field("kind", &K::KIND)
            .field("id", self.id())
            .field("revision", &self.revision())
            .field("removed", &self.is_removed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Operations on objects of one kind, addressed by SID or unique name.
pub struct Objects<K: ObjectType> {
    client: Arc<ClientInner>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ObjectType> Objects<K> {
    pub(crate) fn new(client: Arc<ClientInner>) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    /// Resolves `reference` against the cache.
    pub(crate) fn target(&self, reference: &str) -> SyncResult<Target> {
        self.client.validate_reference(reference)?;
        self.client.ensure_running()?;
        Ok(Target::resolve(&self.client, K::KIND, reference))
    }

    /// Creates a new object, optionally named and with a TTL.
    ///
    /// Fails with [`SyncError::AlreadyExists`] if the name is taken.
    pub async fn create(
        &self,
        unique_name: Option<&str>,
        ttl: Option<Duration>,
    ) -> SyncResult<SyncObject<K>> {
        self.client.create_object(unique_name, ttl).await
    }

    /// Opens the object named `unique_name`, creating it if needed.
    ///
    /// `ttl` only applies when the object is created.
    pub async fn open_or_create(
        &self,
        unique_name: &str,
        ttl: Option<Duration>,
    ) -> SyncResult<SyncObject<K>> {
        self.client.open_or_create_object(unique_name, ttl).await
    }

    /// Opens an existing object by SID or unique name.
    pub async fn open_existing(&self, sid_or_unique_name: &str) -> SyncResult<SyncObject<K>> {
        self.client.open_existing_object(sid_or_unique_name).await
    }

    /// Sets an object's TTL. A zero TTL clears the expiration.
    pub async fn set_ttl(
        &self,
        sid_or_unique_name: &str,
        ttl: Duration,
    ) -> SyncResult<ObjectSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client.mutator().set_ttl(&target, ttl).await
    }

    /// Removes an object.
    pub async fn remove(&self, sid_or_unique_name: &str) -> SyncResult<()> {
        let target = self.target(sid_or_unique_name)?;
        self.client.mutator().remove(&target).await
    }
}

impl<K: ObjectType> Clone for Objects<K> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.client))
    }
}

impl<K: ObjectType> fmt::Debug for Objects<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Objects").field("kind", &K::KIND).finish()
    }
}
