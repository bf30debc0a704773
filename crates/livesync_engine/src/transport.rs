//! Transport layer abstraction for the sync engine.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use livesync_protocol::{
    Command, ConnectionState, Notification, Reply, Sid, SubscriptionOutcome, SubscriptionResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

/// Event reported by a transport to the client that attached to it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The coarse connection state changed.
    ConnectionStateChanged(ConnectionState),
    /// The authority pushed a change for a subscribed object.
    Notification(Notification),
    /// The session token will expire soon.
    TokenAboutToExpire,
    /// The session token has expired.
    TokenExpired,
}

/// Channel on which a transport reports [`TransportEvent`]s, in order.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// A transport carries one logical session with the authority.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (websocket, loopback for tests, mock, etc.). Events
/// must be delivered to the attached sink in the order they occur.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attaches the sink that receives this transport's events.
    fn attach(&self, sink: EventSink);

    /// Opens the session using `token`.
    async fn connect(&self, token: &str) -> SyncResult<()>;

    /// Replaces the session token.
    async fn update_token(&self, token: &str) -> SyncResult<()>;

    /// Closes the session. No events are delivered afterwards.
    async fn shutdown(&self);

    /// Returns the current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Sends a command and waits for its reply.
    async fn request(&self, command: Command) -> SyncResult<Reply>;
}

/// Supplies session tokens. The engine never persists or inspects them.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetches a fresh token.
    async fn fetch_token(&self) -> SyncResult<String>;
}

/// A token provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> SyncResult<String> {
        Ok(self.token.clone())
    }
}

/// A mock transport for testing.
///
/// Replies are served from a FIFO queue. Subscribe and unsubscribe
/// commands are answered automatically so scripted replies are only
/// consumed by the commands a test is exercising.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<ConnectionState>,
    sink: Mutex<Option<EventSink>>,
    replies: Mutex<VecDeque<SyncResult<Reply>>>,
    requests: Mutex<Vec<Command>>,
    subscribe_outcomes: Mutex<HashMap<Sid, SubscriptionOutcome>>,
    subscribe_failures: Mutex<VecDeque<SyncError>>,
    tokens: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Creates a new, disconnected mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful reply.
    pub fn push_reply(&self, reply: Reply) {
        self.replies.lock().push_back(Ok(reply));
    }

    /// Queues a failed reply.
    pub fn push_error(&self, error: SyncError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Sets the outcome reported when `sid` is subscribed.
    pub fn set_subscribe_outcome(&self, sid: Sid, outcome: SubscriptionOutcome) {
        self.subscribe_outcomes.lock().insert(sid, outcome);
    }

    /// Makes the next subscribe command fail with `error`.
    pub fn fail_next_subscribe(&self, error: SyncError) {
        self.subscribe_failures.lock().push_back(error);
    }

    /// Changes the connection state and reports it.
    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.emit(TransportEvent::ConnectionStateChanged(state));
    }

    /// Reports an event to the attached sink.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    /// Pushes a notification as if the authority sent it.
    pub fn notify(&self, notification: Notification) {
        self.emit(TransportEvent::Notification(notification));
    }

    /// Returns every command sent so far.
    pub fn requests(&self) -> Vec<Command> {
        self.requests.lock().clone()
    }

    /// Counts commands sent with the given name.
    pub fn request_count(&self, name: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|c| c.name() == name)
            .count()
    }

    /// Returns every token passed to `connect` or `update_token`.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    fn answer_subscribe(&self, command: &Command) -> Option<SyncResult<Reply>> {
        match command {
            Command::Subscribe { requests } => {
                if let Some(error) = self.subscribe_failures.lock().pop_front() {
                    return Some(Err(error));
                }
                let outcomes = self.subscribe_outcomes.lock();
                let results = requests
                    .iter()
                    .map(|r| SubscriptionResult {
                        sid: r.sid.clone(),
                        outcome: outcomes
                            .get(&r.sid)
                            .cloned()
                            .unwrap_or(SubscriptionOutcome::Established),
                    })
                    .collect();
                Some(Ok(Reply::Subscriptions(results)))
            }
            Command::Unsubscribe { .. } => Some(Ok(Reply::Done)),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn connect(&self, token: &str) -> SyncResult<()> {
        self.tokens.lock().push(token.to_string());
        self.set_connection_state(ConnectionState::Connected);
        Ok(())
    }

    async fn update_token(&self, token: &str) -> SyncResult<()> {
        self.tokens.lock().push(token.to_string());
        Ok(())
    }

    async fn shutdown(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        self.sink.lock().take();
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn request(&self, command: Command) -> SyncResult<Reply> {
        if !self.connection_state().is_connected() {
            return Err(SyncError::transport_retryable("not connected"));
        }
        self.requests.lock().push(command.clone());
        if let Some(reply) = self.answer_subscribe(&command) {
            return reply;
        }
        self.replies.lock().pop_front().unwrap_or_else(|| {
            Err(SyncError::Protocol(format!(
                "no mock reply queued for {}",
                command.name()
            )))
        })
    }
}
