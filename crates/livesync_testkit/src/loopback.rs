//! In-process transport backed by an [`Authority`].
//!
//! Commands are applied directly to the authority and pushes are delivered
//! through the attached event sink, in order. Tests drive the connection
//! with [`LoopbackTransport::disconnect`], [`LoopbackTransport::reconnect`]
//! and friends to exercise suspension and recovery.

use async_trait::async_trait;
use livesync_engine::{EventSink, SyncError, SyncResult, Transport, TransportEvent};
use livesync_protocol::{Command, ConnectionState, Reply};
use livesync_server::{Authority, PushSink, ServerError, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Maps an authority error to the engine's error model.
pub fn to_sync_error(error: ServerError) -> SyncError {
    match error {
        ServerError::NotFound(msg) => SyncError::NotFound(msg),
        ServerError::NameAlreadyExists(msg) => SyncError::AlreadyExists(msg),
        err @ ServerError::PreconditionFailed { .. } => SyncError::Conflict(err.to_string()),
        ServerError::PermissionDenied(msg) | ServerError::AuthenticationFailed(msg) => {
            SyncError::PermissionDenied(msg)
        }
        ServerError::InvalidRequest(msg) => SyncError::InvalidArgument(msg),
        ServerError::Internal(msg) => SyncError::Fatal(msg),
    }
}

/// A [`Transport`] that talks to an in-process [`Authority`].
pub struct LoopbackTransport {
    authority: Arc<Authority>,
    sink: Arc<Mutex<Option<EventSink>>>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<SessionId>>,
    token: Mutex<Option<String>>,
    injected_failures: Mutex<HashMap<&'static str, usize>>,
    sent: Mutex<Vec<&'static str>>,
    shut_down: AtomicBool,
}

impl LoopbackTransport {
    /// Creates a disconnected transport for `authority`.
    pub fn new(authority: Arc<Authority>) -> Arc<Self> {
        Arc::new(Self {
            authority,
            sink: Arc::new(Mutex::new(None)),
            state: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            token: Mutex::new(None),
            injected_failures: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The authority behind this transport.
    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    /// The current authority session, if connected.
    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    /// Reports an event to the attached client.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            debug!(state = ?state, "loopback connection state");
            self.emit(TransportEvent::ConnectionStateChanged(state));
        }
    }

    fn open_session(&self, token: &str) -> SyncResult<()> {
        let sink = Arc::clone(&self.sink);
        let push: PushSink = Arc::new(move |notification| {
            if let Some(sink) = sink.lock().as_ref() {
                let _ = sink.send(TransportEvent::Notification(notification));
            }
        });
        match self.authority.open_session(token, push) {
            Ok(session) => {
                *self.session.lock() = Some(session);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Denied);
                Err(to_sync_error(err))
            }
        }
    }

    fn close_session(&self) {
        if let Some(session) = self.session.lock().take() {
            self.authority.close_session(session);
        }
    }

    /// Drops the connection. The authority forgets the session's
    /// subscriptions and commands fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.close_session();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Re-opens the session with the last token.
    pub fn reconnect(&self) -> SyncResult<()> {
        let token = self
            .token
            .lock()
            .clone()
            .ok_or_else(|| SyncError::InvalidArgument("never connected".into()))?;
        self.set_state(ConnectionState::Connecting);
        self.open_session(&token)
    }

    /// Simulates the authority rejecting the session.
    pub fn deny(&self) {
        self.close_session();
        self.set_state(ConnectionState::Denied);
    }

    /// Simulates an unrecoverable transport failure.
    pub fn fail_fatally(&self) {
        self.close_session();
        self.set_state(ConnectionState::FatalError);
    }

    /// Reports that the session token will expire soon.
    pub fn token_about_to_expire(&self) {
        self.emit(TransportEvent::TokenAboutToExpire);
    }

    /// Reports that the session token expired.
    pub fn expire_token(&self) {
        self.emit(TransportEvent::TokenExpired);
    }

    /// Makes the next `count` commands named `command` fail with a
    /// retryable transport error.
    pub fn fail_next(&self, command: &'static str, count: usize) {
        *self.injected_failures.lock().entry(command).or_default() += count;
    }

    /// Counts commands sent with the given name.
    pub fn sent_count(&self, command: &str) -> usize {
        self.sent.lock().iter().filter(|name| **name == command).count()
    }

    /// The last token passed to `connect` or `update_token`.
    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn take_injected_failure(&self, command: &'static str) -> bool {
        let mut failures = self.injected_failures.lock();
        match failures.get_mut(command) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn connect(&self, token: &str) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }
        *self.token.lock() = Some(token.to_string());
        self.set_state(ConnectionState::Connecting);
        self.open_session(token)
    }

    async fn update_token(&self, token: &str) -> SyncResult<()> {
        *self.token.lock() = Some(token.to_string());
        let session = self.session();
        match session {
            Some(session) => self
                .authority
                .refresh_session(session, token)
                .map_err(to_sync_error),
            None => Ok(()),
        }
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.sink.lock().take();
        self.close_session();
        *self.state.lock() = ConnectionState::Disconnected;
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn request(&self, command: Command) -> SyncResult<Reply> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("transport shut down"));
        }
        let name = command.name();
        self.sent.lock().push(name);
        if self.take_injected_failure(name) {
            return Err(SyncError::transport_retryable(format!(
                "injected failure for {name}"
            )));
        }
        let session = match (self.connection_state(), self.session()) {
            (ConnectionState::Connected, Some(session)) => session,
            _ => return Err(SyncError::transport_retryable("not connected")),
        };
        self.authority
            .handle(session, command)
            .map_err(to_sync_error)
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("state", &self.connection_state())
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_protocol::ObjectKind;
    use livesync_server::ServerConfig;
    use tokio::sync::mpsc;

    fn create_command() -> Command {
        Command::Create {
            kind: ObjectKind::Document,
            unique_name: None,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn requests_require_connection() {
        let transport = LoopbackTransport::new(Arc::new(Authority::new(ServerConfig::default())));
        let err = transport.request(create_command()).await.unwrap_err();
        assert!(err.is_retryable());

        transport.connect("alice").await.unwrap();
        assert!(transport.request(create_command()).await.is_ok());

        transport.disconnect();
        assert!(transport.request(create_command()).await.unwrap_err().is_retryable());

        transport.reconnect().unwrap();
        assert!(transport.request(create_command()).await.is_ok());
        assert_eq!(transport.sent_count("create"), 4);
    }

    #[tokio::test]
    async fn state_changes_are_reported() {
        let transport = LoopbackTransport::new(Arc::new(Authority::new(ServerConfig::default())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach(tx);

        transport.connect("alice").await.unwrap();
        transport.deny();

        let mut states = Vec::new();
        while let Ok(TransportEvent::ConnectionStateChanged(state)) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Denied
            ]
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let transport = LoopbackTransport::new(Arc::new(Authority::new(ServerConfig::default())));
        transport.connect("alice").await.unwrap();
        transport.fail_next("create", 1);
        assert!(transport.request(create_command()).await.is_err());
        assert!(transport.request(create_command()).await.is_ok());
    }

    #[test]
    fn error_mapping() {
        assert!(matches!(
            to_sync_error(ServerError::PreconditionFailed {
                expected: 1,
                actual: 2
            }),
            SyncError::Conflict(_)
        ));
        assert!(matches!(
            to_sync_error(ServerError::NameAlreadyExists("x".into())),
            SyncError::AlreadyExists(_)
        ));
        assert!(matches!(
            to_sync_error(ServerError::AuthenticationFailed("x".into())),
            SyncError::PermissionDenied(_)
        ));
    }
}
