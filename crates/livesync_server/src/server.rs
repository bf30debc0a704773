//! The in-memory authority.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{self, Handled};
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use livesync_protocol::{
    Command, Notification, ObjectKind, Reply, Sid, SubscriptionOutcome, SubscriptionRequest,
    SubscriptionResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Receives pushes for one session.
pub type PushSink = Arc<dyn Fn(Notification) + Send + Sync>;

/// Identifies an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

struct Session {
    identity: String,
    sink: PushSink,
    subscriptions: HashSet<Sid>,
}

/// The reference authority.
///
/// Objects live in memory. Clients talk to it through sessions: each
/// session has an identity taken from its token, a push sink and a set
/// of subscriptions. Every applied write is pushed to all sessions
/// subscribed to the object, the writer included. Expired objects and
/// items are swept before each command.
///
/// # Example
///
/// ```
/// use livesync_protocol::{Command, ObjectKind};
/// use livesync_server::{Authority, ServerConfig};
/// use std::sync::Arc;
///
/// let authority = Authority::new(ServerConfig::default());
/// let token = authority.issue_token("alice").unwrap();
/// let session = authority.open_session(&token, Arc::new(|_push| {})).unwrap();
///
/// let reply = authority
///     .handle(
///         session,
///         Command::Create {
///             kind: ObjectKind::Document,
///             unique_name: Some("settings".into()),
///             ttl: None,
///         },
///     )
///     .unwrap();
/// assert_eq!(reply.into_object().unwrap().revision, 1);
/// ```
pub struct Authority {
    config: ServerConfig,
    validator: Option<TokenValidator>,
    store: Mutex<ObjectStore>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    revoked: RwLock<HashSet<(String, Sid)>>,
    next_session: AtomicU64,
}

impl Authority {
    /// Creates an authority with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        let validator = config.auth.clone().map(TokenValidator::new);
        Self {
            store: Mutex::new(ObjectStore::new(&config)),
            config,
            validator,
            sessions: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// The authority configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Issues a session token for `identity`.
    ///
    /// Without authentication the token is the identity itself.
    pub fn issue_token(&self, identity: &str) -> ServerResult<String> {
        match &self.validator {
            Some(validator) => validator.create_token(identity),
            None => Ok(identity.to_string()),
        }
    }

    fn authenticate(&self, token: &str) -> ServerResult<String> {
        match &self.validator {
            Some(validator) => validator.validate_token(token),
            None if token.is_empty() => {
                Err(ServerError::AuthenticationFailed("empty token".into()))
            }
            None => Ok(token.to_string()),
        }
    }

    /// Opens a session for the identity carried by `token`.
    pub fn open_session(&self, token: &str, sink: PushSink) -> ServerResult<SessionId> {
        let identity = self.authenticate(token)?;
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        info!(session = %id, identity = %identity, "session opened");
        self.sessions.write().insert(
            id,
            Session {
                identity,
                sink,
                subscriptions: HashSet::new(),
            },
        );
        Ok(id)
    }

    /// Replaces a session's token. The identity must not change.
    pub fn refresh_session(&self, session: SessionId, token: &str) -> ServerResult<()> {
        let identity = self.authenticate(token)?;
        let sessions = self.sessions.read();
        let current = sessions
            .get(&session)
            .ok_or_else(|| ServerError::AuthenticationFailed(format!("unknown {session}")))?;
        if current.identity != identity {
            return Err(ServerError::AuthenticationFailed(
                "token issued for another identity".into(),
            ));
        }
        debug!(session = %session, "session token refreshed");
        Ok(())
    }

    /// Closes a session, dropping its subscriptions.
    pub fn close_session(&self, session: SessionId) -> bool {
        let closed = self.sessions.write().remove(&session).is_some();
        if closed {
            info!(session = %session, "session closed");
        }
        closed
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.store.lock().len()
    }

    /// SIDs the session is subscribed to.
    pub fn subscriptions(&self, session: SessionId) -> Vec<Sid> {
        let mut sids: Vec<Sid> = self
            .sessions
            .read()
            .get(&session)
            .map(|s| s.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        sids.sort();
        sids
    }

    fn identity(&self, session: SessionId) -> ServerResult<String> {
        self.sessions
            .read()
            .get(&session)
            .map(|s| s.identity.clone())
            .ok_or_else(|| ServerError::AuthenticationFailed(format!("unknown {session}")))
    }

    fn is_revoked(&self, identity: &str, sid: &Sid) -> bool {
        self.revoked
            .read()
            .contains(&(identity.to_string(), sid.clone()))
    }

    /// Handles a command from a session.
    pub fn handle(&self, session: SessionId, command: Command) -> ServerResult<Reply> {
        self.handle_at(session, command, Utc::now())
    }

    /// Handles a command from a session as of `now`.
    pub fn handle_at(
        &self,
        session: SessionId,
        command: Command,
        now: DateTime<Utc>,
    ) -> ServerResult<Reply> {
        let identity = self.identity(session)?;
        self.expire_due(now);
        debug!(session = %session, command = command.name(), "handling command");

        match command {
            Command::Subscribe { requests } => Ok(self.subscribe(session, &identity, requests)),
            Command::Unsubscribe { sids } => {
                if let Some(state) = self.sessions.write().get_mut(&session) {
                    for sid in &sids {
                        state.subscriptions.remove(sid);
                    }
                }
                Ok(Reply::Done)
            }
            command => {
                let handled = {
                    let mut store = self.store.lock();
                    if let Some((kind, reference)) = handler::target_of(&command) {
                        let sid = store.resolve(kind, reference)?;
                        if self.is_revoked(&identity, &sid) {
                            return Err(ServerError::PermissionDenied(format!(
                                "{identity} may not access {sid}"
                            )));
                        }
                    }
                    handler::apply(&mut store, command, now)?
                };
                Ok(self.deliver(handled))
            }
        }
    }

    /// Applies a command with authority privileges, outside any session.
    ///
    /// Used to simulate writes from other services, such as a backend
    /// changing an object's TTL.
    pub fn handle_as_admin(&self, command: Command) -> ServerResult<Reply> {
        self.handle_as_admin_at(command, Utc::now())
    }

    /// Applies an admin command as of `now`.
    pub fn handle_as_admin_at(&self, command: Command, now: DateTime<Utc>) -> ServerResult<Reply> {
        self.expire_due(now);
        let handled = handler::apply(&mut self.store.lock(), command, now)?;
        Ok(self.deliver(handled))
    }

    /// Sets an object's TTL with authority privileges.
    pub fn admin_set_ttl(
        &self,
        kind: ObjectKind,
        reference: &str,
        ttl: Duration,
    ) -> ServerResult<Reply> {
        self.handle_as_admin(Command::SetTtl {
            kind,
            target: reference.to_string(),
            ttl,
            if_revision: None,
        })
    }

    /// Expires every object and item due at `now`, pushing removals.
    ///
    /// Returns the number of removals.
    pub fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let pushes = self.store.lock().expire_due(now);
        let count = pushes.len();
        if count > 0 {
            info!(count, "expired objects and items");
            self.fan_out(pushes);
        }
        count
    }

    /// Spawns a task that sweeps expired objects and items every `period`.
    ///
    /// The task stops once the authority is dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let authority = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(authority) = authority.upgrade() else {
                    break;
                };
                authority.expire_due(Utc::now());
            }
            debug!("expiry sweeper stopped");
        })
    }

    /// Revokes `identity`'s access to `sid`.
    ///
    /// Later commands fail with `PermissionDenied`, and existing
    /// subscriptions stop receiving pushes and are refused on renewal.
    pub fn revoke_access(&self, identity: &str, sid: &Sid) {
        warn!(identity, sid = %sid, "access revoked");
        self.revoked
            .write()
            .insert((identity.to_string(), sid.clone()));
        for session in self.sessions.write().values_mut() {
            if session.identity == identity {
                session.subscriptions.remove(sid);
            }
        }
    }

    /// Restores access revoked with [`revoke_access`](Self::revoke_access).
    pub fn grant_access(&self, identity: &str, sid: &Sid) {
        self.revoked
            .write()
            .remove(&(identity.to_string(), sid.clone()));
    }

    fn subscribe(
        &self,
        session: SessionId,
        identity: &str,
        requests: Vec<SubscriptionRequest>,
    ) -> Reply {
        let mut results = Vec::with_capacity(requests.len());
        let mut initial = Vec::new();
        {
            let store = self.store.lock();
            let mut sessions = self.sessions.write();
            let Some(state) = sessions.get_mut(&session) else {
                return Reply::Subscriptions(Vec::new());
            };
            for request in requests {
                let outcome = match store.snapshot(request.kind, request.sid.as_str()) {
                    Err(err) => SubscriptionOutcome::Failed(err.to_remote()),
                    Ok(_) if self.is_revoked(identity, &request.sid) => {
                        SubscriptionOutcome::Failed(
                            ServerError::PermissionDenied(format!(
                                "{identity} may not access {}",
                                request.sid
                            ))
                            .to_remote(),
                        )
                    }
                    Ok(snapshot) => {
                        let missed = match request.since_item_revision {
                            Some(since) => store
                                .item_changes_since(request.kind, request.sid.as_str(), since)
                                .unwrap_or_default(),
                            None => Vec::new(),
                        };
                        if !missed.is_empty() {
                            debug!(sid = %request.sid, count = missed.len(), "replaying item changes");
                        }
                        state.subscriptions.insert(request.sid.clone());
                        initial.push(Notification::ObjectUpdated(snapshot));
                        initial.extend(missed);
                        SubscriptionOutcome::Established
                    }
                };
                results.push(SubscriptionResult {
                    sid: request.sid,
                    outcome,
                });
            }
        }

        // Newly subscribed sessions get the current state, then any item
        // changes they missed.
        if let Some(sink) = self.sink(session) {
            for push in initial {
                sink(push);
            }
        }
        Reply::Subscriptions(results)
    }

    fn sink(&self, session: SessionId) -> Option<PushSink> {
        self.sessions
            .read()
            .get(&session)
            .map(|s| Arc::clone(&s.sink))
    }

    fn deliver(&self, handled: Handled) -> Reply {
        self.fan_out(handled.pushes);
        handled.reply
    }

    fn fan_out(&self, pushes: Vec<Notification>) {
        for push in pushes {
            let sinks: Vec<PushSink> = {
                let mut sessions = self.sessions.write();
                let sinks = sessions
                    .values()
                    .filter(|s| s.subscriptions.contains(push.sid()))
                    .map(|s| Arc::clone(&s.sink))
                    .collect();
                if let Notification::ObjectRemoved { sid, .. } = &push {
                    for session in sessions.values_mut() {
                        session.subscriptions.remove(sid);
                    }
                }
                sinks
            };
            debug!(
                sid = %push.sid(),
                event = push.event_name(),
                receivers = sinks.len(),
                "fan-out"
            );
            for sink in sinks {
                sink(push.clone());
            }
        }
    }
}

impl fmt::Debug for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authority")
            .field("objects", &self.object_count())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
