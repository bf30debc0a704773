//! The sync client.

use crate::cache::ObjectCache;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::iterator::{ItemIterator, QueryOptions};
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::mutator::{Mutator, Target};
use crate::objects::{Documents, Lists, Maps, ObjectType, Streams, SyncObject};
use crate::subscription::{DispatchGate, SubscriptionManager, SubscriptionStats};
use crate::transport::{TokenProvider, Transport, TransportEvent};
use livesync_protocol::{Command, ConnectionState, ItemsQuery, ObjectSnapshot, Reply};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by a client, its facades and its handles.
pub(crate) struct ClientInner {
    pub(crate) config: SyncConfig,
    pub(crate) transport: Arc<dyn Transport>,
    token_provider: Arc<dyn TokenProvider>,
    pub(crate) gate: DispatchGate,
    pub(crate) cache: Arc<ObjectCache>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    connection_state: RwLock<ConnectionState>,
    connection_listeners: ListenerRegistry<ConnectionState>,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    pub(crate) fn ensure_running(&self) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(SyncError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Sends a command to the authority.
    pub(crate) async fn request(&self, command: Command) -> SyncResult<Reply> {
        self.ensure_running()?;
        debug!(command = command.name(), target = command.target().unwrap_or(""), "request");
        self.transport.request(command).await
    }

    pub(crate) fn mutator(&self) -> Mutator<'_> {
        Mutator::new(self)
    }

    pub(crate) fn validate_ttl(&self, ttl: Duration) -> SyncResult<()> {
        if ttl > self.config.max_ttl {
            return Err(SyncError::InvalidArgument(format!(
                "ttl of {}s exceeds the maximum of {}s",
                ttl.as_secs(),
                self.config.max_ttl.as_secs()
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_reference(&self, reference: &str) -> SyncResult<()> {
        if reference.trim().is_empty() {
            return Err(SyncError::InvalidArgument(
                "sid or unique name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Opens a handle on the object described by `snapshot`.
    fn open_handle<K: ObjectType>(
        self: &Arc<Self>,
        snapshot: ObjectSnapshot,
    ) -> SyncResult<SyncObject<K>> {
        if snapshot.kind != K::KIND {
            return Err(SyncError::Protocol(format!(
                "expected a {} but {} is a {}",
                K::KIND,
                snapshot.sid,
                snapshot.kind
            )));
        }
        let shared = self.cache.register(snapshot);
        Ok(SyncObject::new(Arc::clone(self), shared))
    }

    pub(crate) async fn create_object<K: ObjectType>(
        self: &Arc<Self>,
        unique_name: Option<&str>,
        ttl: Option<Duration>,
    ) -> SyncResult<SyncObject<K>> {
        if let Some(name) = unique_name {
            self.validate_reference(name)?;
        }
        if let Some(ttl) = ttl {
            self.validate_ttl(ttl)?;
        }
        let snapshot = self
            .request(Command::Create {
                kind: K::KIND,
                unique_name: unique_name.map(str::to_string),
                ttl,
            })
            .await?
            .into_object()?;
        info!(sid = %snapshot.sid, kind = %K::KIND, "object created");
        self.open_handle(snapshot)
    }

    pub(crate) async fn open_existing_object<K: ObjectType>(
        self: &Arc<Self>,
        reference: &str,
    ) -> SyncResult<SyncObject<K>> {
        self.validate_reference(reference)?;
        self.ensure_running()?;
        if let Some(shared) = self.cache.lookup(K::KIND, reference) {
            debug!(sid = %shared.sid(), "opened from cache");
            return Ok(SyncObject::new(Arc::clone(self), shared));
        }
        let snapshot = self
            .request(Command::Open {
                kind: K::KIND,
                target: reference.to_string(),
            })
            .await?
            .into_object()?;
        self.open_handle(snapshot)
    }

    pub(crate) async fn open_or_create_object<K: ObjectType>(
        self: &Arc<Self>,
        unique_name: &str,
        ttl: Option<Duration>,
    ) -> SyncResult<SyncObject<K>> {
        self.validate_reference(unique_name)?;
        self.ensure_running()?;
        if let Some(shared) = self.cache.lookup(K::KIND, unique_name) {
            return Ok(SyncObject::new(Arc::clone(self), shared));
        }
        match self.create_object(Some(unique_name), ttl).await {
            Err(SyncError::AlreadyExists(_)) => {
                debug!(unique_name, "name taken, opening existing object");
                self.open_existing_object(unique_name).await
            }
            other => other,
        }
    }

    pub(crate) fn query_items(
        &self,
        target: &Target,
        options: QueryOptions,
    ) -> SyncResult<ItemIterator> {
        self.ensure_running()?;
        if !target.kind.is_collection() {
            return Err(SyncError::InvalidArgument(format!(
                "{} has no items",
                target.kind
            )));
        }
        let query = ItemsQuery {
            kind: target.kind,
            target: target.reference.clone(),
            from: options.start,
            include_from: options.include_start,
            order: options.order,
            page_size: options.page_size.unwrap_or(self.config.page_size),
            page_token: None,
        };
        Ok(ItemIterator::new(
            Arc::clone(&self.transport),
            query,
            self.config.iterator_buffer,
        ))
    }

    fn on_connection_state(&self, state: ConnectionState) {
        let _gate = self.gate.lock();
        {
            let mut current = self.connection_state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        info!(state = ?state, "connection state changed");
        self.subscriptions.on_connection_state(state);
        self.connection_listeners.notify(&state);
    }

    async fn refresh_token(&self) {
        match self.token_provider.fetch_token().await {
            Ok(token) => match self.transport.update_token(&token).await {
                Ok(()) => debug!("session token refreshed"),
                Err(e) => warn!(error = %e, "failed to apply refreshed token"),
            },
            Err(e) => warn!(error = %e, "failed to fetch a fresh token"),
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.subscriptions.shutdown();
        self.abort_tasks();
    }
}

/// Consumes transport events in order.
async fn dispatch(client: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        if client.ensure_running().is_err() {
            break;
        }
        match event {
            TransportEvent::ConnectionStateChanged(state) => client.on_connection_state(state),
            TransportEvent::Notification(notification) => {
                client.cache.apply_notification(notification)
            }
            TransportEvent::TokenAboutToExpire | TransportEvent::TokenExpired => {
                debug!("token refresh requested");
                tokio::spawn(async move { client.refresh_token().await });
            }
        }
    }
    debug!("dispatch loop stopped");
}

/// A client keeping shared objects in sync with the authority.
///
/// Cloning a client is cheap; clones share one cache, one subscription
/// manager and one transport session.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Attaches to `transport`, fetches a token and opens the session.
    pub async fn connect(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> SyncResult<Self> {
        let (sink, events) = mpsc::unbounded_channel();
        transport.attach(sink);

        let gate: DispatchGate = Arc::new(ReentrantMutex::new(()));
        let cache = Arc::new(ObjectCache::new(Arc::clone(&gate)));
        let subscriptions = SubscriptionManager::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&gate),
            cache.clone(),
        );

        let inner = Arc::new(ClientInner {
            config,
            connection_state: RwLock::new(transport.connection_state()),
            transport,
            token_provider,
            gate,
            cache,
            subscriptions,
            connection_listeners: ListenerRegistry::new(),
            shut_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let retrier = inner.subscriptions.start();
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), events));
        inner.tasks.lock().extend([retrier, dispatcher]);

        let token = inner.token_provider.fetch_token().await?;
        inner.transport.connect(&token).await?;
        info!("sync client connected");

        Ok(Self { inner })
    }

    /// Returns the last connection state reported by the transport.
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.read()
    }

    /// Registers a connection state listener.
    pub fn on_connection_state_changed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.connection_listeners.add(callback)
    }

    /// Unregisters a connection state listener.
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.inner.connection_listeners.remove(id)
    }

    /// Document operations.
    pub fn documents(&self) -> Documents {
        Documents::new(Arc::clone(&self.inner))
    }

    /// List operations.
    pub fn lists(&self) -> Lists {
        Lists::new(Arc::clone(&self.inner))
    }

    /// Map operations.
    pub fn maps(&self) -> Maps {
        Maps::new(Arc::clone(&self.inner))
    }

    /// Stream operations.
    pub fn streams(&self) -> Streams {
        Streams::new(Arc::clone(&self.inner))
    }

    /// Statistics about subscription attempts.
    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.inner.subscriptions.stats()
    }

    /// Number of objects with at least one open handle.
    pub fn open_object_count(&self) -> usize {
        self.inner.cache.len()
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.ensure_running().is_err()
    }

    /// Closes the session. Later operations fail with [`SyncError::Shutdown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down sync client");
        self.inner.subscriptions.shutdown();
        self.inner.transport.shutdown().await;
        self.inner.abort_tasks();

        let _gate = self.inner.gate.lock();
        *self.inner.connection_state.write() = ConnectionState::Disconnected;
        self.inner
            .connection_listeners
            .notify(&ConnectionState::Disconnected);
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("connection_state", &self.connection_state())
            .field("open_objects", &self.open_object_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, StaticTokenProvider};
    use chrono::Utc;
    use livesync_protocol::{ObjectKind, Sid};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn snapshot(sid: &str, kind: ObjectKind, revision: u64) -> ObjectSnapshot {
        let now = Utc::now();
        ObjectSnapshot {
            sid: Sid::new(sid),
            unique_name: Some("settings".into()),
            kind,
            revision,
            date_created: now,
            date_updated: now,
            date_expires: None,
            data: (kind == ObjectKind::Document)
                .then(|| json!({ "v": revision }).as_object().cloned().unwrap()),
            item_revision: 0,
        }
    }

    async fn client() -> (Arc<MockTransport>, SyncClient) {
        let transport = Arc::new(MockTransport::new());
        let client = SyncClient::connect(
            SyncConfig::default(),
            transport.clone(),
            Arc::new(StaticTokenProvider::new("token")),
        )
        .await
        .unwrap();
        (transport, client)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connect_uses_token() {
        let (transport, client) = client().await;
        settle().await;
        assert_eq!(transport.tokens(), vec!["token".to_string()]);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn token_expiry_refetches() {
        let (transport, _client) = client().await;
        transport.emit(TransportEvent::TokenExpired);
        settle().await;
        assert_eq!(transport.tokens().len(), 2);
    }

    #[tokio::test]
    async fn connection_listener_sees_changes() {
        let (transport, client) = client().await;
        settle().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        client.on_connection_state_changed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        transport.set_connection_state(ConnectionState::Disconnected);
        transport.set_connection_state(ConnectionState::Connected);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_existing_reuses_cache() {
        let (transport, client) = client().await;
        transport.push_reply(Reply::Object(snapshot("ET1", ObjectKind::Document, 1)));

        let a = client.documents().open_existing("ET1").await.unwrap();
        let b = client.documents().open_existing("settings").await.unwrap();
        assert_eq!(a.sid(), b.sid());
        assert_eq!(transport.request_count("open"), 1);
        assert_eq!(client.open_object_count(), 1);

        drop(a);
        drop(b);
        assert_eq!(client.open_object_count(), 0);
    }

    #[tokio::test]
    async fn open_or_create_falls_back_to_open() {
        let (transport, client) = client().await;
        transport.push_error(SyncError::AlreadyExists("settings".into()));
        transport.push_reply(Reply::Object(snapshot("ET1", ObjectKind::Document, 4)));

        let doc = client
            .documents()
            .open_or_create("settings", None)
            .await
            .unwrap();
        assert_eq!(doc.revision(), 4);
        assert_eq!(transport.request_count("create"), 1);
        assert_eq!(transport.request_count("open"), 1);
    }

    #[tokio::test]
    async fn validation_rejects_bad_arguments() {
        let (_transport, client) = client().await;
        let err = client.documents().create(Some("  "), None).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));

        let err = client
            .documents()
            .create(None, Some(Duration::from_secs(u64::MAX / 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_operations() {
        let (_transport, client) = client().await;
        client.shutdown().await;
        assert!(client.is_shut_down());
        let err = client.documents().open_existing("ET1").await.unwrap_err();
        assert_eq!(err, SyncError::Shutdown);
    }
}
