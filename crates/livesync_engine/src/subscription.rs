//! Subscription state machine.
//!
//! Every locally opened object has one subscription, shared by all of its
//! handles. The manager tracks the desired state (a handle exists) against
//! the actual state reported by the authority, and a single retrier task
//! drives pending subscriptions to `Established` whenever the transport is
//! connected.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;
use livesync_protocol::{
    Command, ConnectionState, ObjectKind, Sid, SubscriptionOutcome, SubscriptionRequest,
    SubscriptionResult,
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Serializes cache mutations, subscription transitions and listener calls.
///
/// Reentrant so listeners may call back into the engine from the
/// dispatch path.
pub(crate) type DispatchGate = Arc<ReentrantMutex<()>>;

/// The subscription state of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No local handle wants pushes for the object.
    Unsubscribed,
    /// Waiting for the retrier to request a subscription.
    Pending,
    /// A subscribe command is in flight.
    Establishing,
    /// Pushes are being delivered.
    Established,
    /// The transport dropped; will re-establish on reconnect.
    Suspended,
    /// The subscription can never be established.
    Failed(SyncError),
}

impl SubscriptionState {
    /// Returns true if pushes are being delivered.
    pub fn is_established(&self) -> bool {
        matches!(self, SubscriptionState::Established)
    }

    /// Returns true if the state can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Failed(_))
    }

    /// Returns the error of a failed subscription.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            SubscriptionState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Short state name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Establishing => "establishing",
            SubscriptionState::Established => "established",
            SubscriptionState::Suspended => "suspended",
            SubscriptionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Failed(err) => write!(f, "failed: {err}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Statistics about subscription attempts.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStats {
    /// Subscribe commands sent.
    pub batches_sent: u64,
    /// Subscriptions that reached `Established`.
    pub established: u64,
    /// Subscriptions that reached `Failed`.
    pub failed: u64,
    /// Batches that were retried after a transport failure.
    pub retries: u64,
    /// Last transport error seen by the retrier.
    pub last_error: Option<String>,
}

/// Receives every subscription transition, under the dispatch gate.
pub(crate) trait SubscriptionObserver: Send + Sync {
    fn on_subscription_state(&self, sid: &Sid, state: &SubscriptionState);

    /// Item revision a resubscription of `sid` should resume after.
    fn resume_point(&self, _sid: &Sid) -> Option<u64> {
        None
    }
}

struct Entry {
    kind: ObjectKind,
    handles: usize,
    state: SubscriptionState,
    watch: watch::Sender<SubscriptionState>,
}

struct DueSubscription {
    sid: Sid,
    kind: ObjectKind,
    previous: SubscriptionState,
    resume_after: Option<u64>,
}

enum Pass {
    Idle,
    Progress,
    Failed(SyncError),
}

pub(crate) struct SubscriptionManager {
    batch_size: usize,
    retry: RetryConfig,
    transport: Arc<dyn Transport>,
    gate: DispatchGate,
    observer: Arc<dyn SubscriptionObserver>,
    entries: Mutex<HashMap<Sid, Entry>>,
    pending_unsubscribes: Mutex<Vec<Sid>>,
    wake: Notify,
    shutdown: AtomicBool,
    stats: RwLock<SubscriptionStats>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        config: &SyncConfig,
        transport: Arc<dyn Transport>,
        gate: DispatchGate,
        observer: Arc<dyn SubscriptionObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            batch_size: config.subscription_batch_size.max(1),
            retry: config.subscription_retry.clone(),
            transport,
            gate,
            observer,
            entries: Mutex::new(HashMap::new()),
            pending_unsubscribes: Mutex::new(Vec::new()),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            stats: RwLock::new(SubscriptionStats::default()),
        })
    }

    /// Spawns the retrier task.
    pub(crate) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run().await })
    }

    /// Stops the retrier and forgets every subscription.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _gate = self.gate.lock();
        self.entries.lock().clear();
        self.pending_unsubscribes.lock().clear();
        self.wake.notify_one();
    }

    pub(crate) fn stats(&self) -> SubscriptionStats {
        self.stats.read().clone()
    }

    /// Current state of the subscription for `sid`.
    pub(crate) fn state(&self, sid: &Sid) -> SubscriptionState {
        self.entries
            .lock()
            .get(sid)
            .map(|e| e.state.clone())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Number of local handles holding the subscription for `sid`.
    pub(crate) fn handle_count(&self, sid: &Sid) -> usize {
        self.entries.lock().get(sid).map_or(0, |e| e.handles)
    }

    /// Registers one more local handle for `sid`.
    pub(crate) fn acquire(&self, sid: &Sid, kind: ObjectKind) {
        let _gate = self.gate.lock();
        let first = {
            let mut entries = self.entries.lock();
            match entries.get_mut(sid) {
                Some(entry) => {
                    entry.handles += 1;
                    false
                }
                None => {
                    let (watch, _) = watch::channel(SubscriptionState::Unsubscribed);
                    entries.insert(
                        sid.clone(),
                        Entry {
                            kind,
                            handles: 1,
                            state: SubscriptionState::Unsubscribed,
                            watch,
                        },
                    );
                    true
                }
            }
        };

        if first {
            self.pending_unsubscribes.lock().retain(|s| s != sid);
            debug!(sid = %sid, kind = %kind, "subscription requested");
            self.transition(sid, SubscriptionState::Pending);
            self.wake.notify_one();
        }
    }

    /// Drops one local handle for `sid`; the last one ends the subscription.
    ///
    /// Returns true once no handle for `sid` remains.
    pub(crate) fn release(&self, sid: &Sid) -> bool {
        let _gate = self.gate.lock();
        let removed = {
            let mut entries = self.entries.lock();
            let last = match entries.get_mut(sid) {
                Some(entry) => {
                    entry.handles = entry.handles.saturating_sub(1);
                    entry.handles == 0
                }
                None => false,
            };
            if last {
                entries.remove(sid)
            } else {
                None
            }
        };

        let Some(entry) = removed else {
            return !self.entries.lock().contains_key(sid);
        };

        let subscribed_remotely = matches!(
            entry.state,
            SubscriptionState::Establishing
                | SubscriptionState::Established
                | SubscriptionState::Suspended
        );
        if subscribed_remotely {
            self.pending_unsubscribes.lock().push(sid.clone());
            self.wake.notify_one();
        }

        if !entry.state.is_terminal() {
            entry.watch.send_replace(SubscriptionState::Unsubscribed);
            debug!(sid = %sid, "subscription released");
            self.observer
                .on_subscription_state(sid, &SubscriptionState::Unsubscribed);
        }
        true
    }

    /// Waits until the subscription for `sid` is established or fails.
    ///
    /// `Established` only counts while the transport is connected. A
    /// disconnect the dispatcher has not processed yet always ends in a
    /// `Suspended` transition, which wakes the wait again.
    pub(crate) async fn wait_established(&self, sid: &Sid) -> SyncResult<()> {
        let receiver = self.entries.lock().get(sid).map(|e| e.watch.subscribe());
        let Some(mut receiver) = receiver else {
            return Err(SyncError::InvalidArgument(format!(
                "{sid} has no open handle"
            )));
        };

        loop {
            let state = receiver.borrow_and_update().clone();
            match state {
                SubscriptionState::Established
                    if self.transport.connection_state().is_connected() =>
                {
                    return Ok(());
                }
                SubscriptionState::Failed(err) => return Err(err),
                SubscriptionState::Unsubscribed => return Err(SyncError::Shutdown),
                _ => {}
            }
            receiver.changed().await.map_err(|_| SyncError::Shutdown)?;
        }
    }

    /// Reacts to a transport connection state change.
    pub(crate) fn on_connection_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.wake.notify_one();
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                let _gate = self.gate.lock();
                for (sid, current) in self.snapshot_states() {
                    match current {
                        SubscriptionState::Established => {
                            self.transition(&sid, SubscriptionState::Suspended);
                        }
                        SubscriptionState::Establishing => {
                            self.transition(&sid, SubscriptionState::Pending);
                        }
                        _ => {}
                    }
                }
            }
            ConnectionState::Denied => {
                self.fail_all(SyncError::PermissionDenied("connection denied".into()));
            }
            ConnectionState::FatalError => {
                self.fail_all(SyncError::Fatal("transport reported a fatal error".into()));
            }
        }
    }

    fn fail_all(&self, error: SyncError) {
        let _gate = self.gate.lock();
        for (sid, current) in self.snapshot_states() {
            if !current.is_terminal() {
                self.stats.write().failed += 1;
                self.transition(&sid, SubscriptionState::Failed(error.clone()));
            }
        }
    }

    fn snapshot_states(&self) -> Vec<(Sid, SubscriptionState)> {
        let mut states: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(sid, e)| (sid.clone(), e.state.clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Moves `sid` to `to` and notifies the observer. Must hold the gate.
    fn transition(&self, sid: &Sid, to: SubscriptionState) -> bool {
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(sid) else {
                return false;
            };
            if entry.state == to || entry.state.is_terminal() {
                return false;
            }
            debug!(sid = %sid, from = entry.state.name(), to = to.name(), "subscription transition");
            entry.state = to.clone();
            entry.watch.send_replace(to.clone());
        }
        self.observer.on_subscription_state(sid, &to);
        true
    }

    async fn run(&self) {
        let mut attempt = 0u32;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if !self.transport.connection_state().is_connected() {
                self.wake.notified().await;
                continue;
            }

            match self.run_once().await {
                Pass::Idle => {
                    attempt = 0;
                    self.wake.notified().await;
                }
                Pass::Progress => {
                    attempt = 0;
                }
                Pass::Failed(error) => {
                    attempt += 1;
                    self.stats.write().retries += 1;
                    if !self.retry.allows_attempt(attempt + 1) {
                        warn!(attempt, error = %error, "subscription retries exhausted");
                        self.fail_waiting(error);
                        attempt = 0;
                        continue;
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "subscription backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!("subscription retrier stopped");
    }

    async fn run_once(&self) -> Pass {
        let unsubscribes = std::mem::take(&mut *self.pending_unsubscribes.lock());
        if !unsubscribes.is_empty() {
            let count = unsubscribes.len();
            match self
                .transport
                .request(Command::Unsubscribe { sids: unsubscribes })
                .await
            {
                Ok(_) => debug!(count, "unsubscribed"),
                Err(e) => debug!(count, error = %e, "unsubscribe failed, ignoring"),
            }
        }

        let due = self.take_due();
        if due.is_empty() {
            return Pass::Idle;
        }

        let mut failure = None;
        for chunk in due.chunks(self.batch_size) {
            let requests = chunk
                .iter()
                .map(|d| {
                    let request = SubscriptionRequest::new(d.sid.clone(), d.kind);
                    match d.resume_after {
                        Some(revision) => request.resuming_after(revision),
                        None => request,
                    }
                })
                .collect();
            self.stats.write().batches_sent += 1;

            let result = self
                .transport
                .request(Command::Subscribe { requests })
                .await
                .and_then(|reply| reply.into_subscriptions().map_err(SyncError::from));

            match result {
                Ok(results) => {
                    if let Some(err) = self.complete(chunk, results) {
                        failure = Some(err);
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, batch = chunk.len(), "subscribe failed, will retry");
                    self.stats.write().last_error = Some(e.to_string());
                    self.revert(chunk);
                    failure = Some(e);
                }
                Err(e) => {
                    warn!(error = %e, batch = chunk.len(), "subscribe rejected");
                    self.fail(chunk, &e);
                }
            }
        }

        match failure {
            Some(err) => Pass::Failed(err),
            None => Pass::Progress,
        }
    }

    /// Moves every `Pending`/`Suspended` subscription to `Establishing`.
    fn take_due(&self) -> Vec<DueSubscription> {
        let _gate = self.gate.lock();
        let mut due: Vec<DueSubscription> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| {
                matches!(
                    e.state,
                    SubscriptionState::Pending | SubscriptionState::Suspended
                )
            })
            .map(|(sid, e)| DueSubscription {
                sid: sid.clone(),
                kind: e.kind,
                previous: e.state.clone(),
                resume_after: None,
            })
            .collect();

        for d in &mut due {
            d.resume_after = self.observer.resume_point(&d.sid);
            self.transition(&d.sid, SubscriptionState::Establishing);
        }
        due
    }

    fn complete(
        &self,
        chunk: &[DueSubscription],
        results: Vec<SubscriptionResult>,
    ) -> Option<SyncError> {
        let _gate = self.gate.lock();
        let mut outcomes: HashMap<Sid, SubscriptionOutcome> =
            results.into_iter().map(|r| (r.sid, r.outcome)).collect();
        let mut missing = None;

        for d in chunk {
            let outcome = outcomes.remove(&d.sid);
            let current = self.entries.lock().get(&d.sid).map(|e| e.state.clone());
            if current != Some(SubscriptionState::Establishing) {
                // Released or disconnected while the command was in flight.
                if current.is_none() && outcome == Some(SubscriptionOutcome::Established) {
                    self.pending_unsubscribes.lock().push(d.sid.clone());
                }
                continue;
            }

            match outcome {
                Some(SubscriptionOutcome::Established) => {
                    self.stats.write().established += 1;
                    self.transition(&d.sid, SubscriptionState::Established);
                }
                Some(SubscriptionOutcome::Failed(remote)) => {
                    let err = SyncError::from(remote);
                    info!(sid = %d.sid, error = %err, "subscription failed");
                    self.stats.write().failed += 1;
                    self.transition(&d.sid, SubscriptionState::Failed(err));
                }
                None => {
                    self.transition(&d.sid, d.previous.clone());
                    missing = Some(SyncError::Protocol(format!(
                        "no subscribe result for {}",
                        d.sid
                    )));
                }
            }
        }
        missing
    }

    fn revert(&self, chunk: &[DueSubscription]) {
        let _gate = self.gate.lock();
        for d in chunk {
            if self.state(&d.sid) == SubscriptionState::Establishing {
                self.transition(&d.sid, d.previous.clone());
            }
        }
    }

    fn fail(&self, chunk: &[DueSubscription], error: &SyncError) {
        let _gate = self.gate.lock();
        for d in chunk {
            if self.state(&d.sid) == SubscriptionState::Establishing {
                self.stats.write().failed += 1;
                self.transition(&d.sid, SubscriptionState::Failed(error.clone()));
            }
        }
    }

    /// Fails every subscription still waiting to be established.
    fn fail_waiting(&self, error: SyncError) {
        let _gate = self.gate.lock();
        for (sid, current) in self.snapshot_states() {
            if matches!(
                current,
                SubscriptionState::Pending | SubscriptionState::Suspended
            ) {
                self.stats.write().failed += 1;
                self.transition(&sid, SubscriptionState::Failed(error.clone()));
            }
        }
    }
}
