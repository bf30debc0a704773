//! Recording listeners for asserting on event sequences.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long [`EventRecorder`] waits before failing a test.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Collects events delivered to listeners, in order.
///
/// Clones share the same log, so one clone can be moved into a listener
/// while the test keeps another.
#[derive(Debug, Clone)]
pub struct EventRecorder<T> {
    events: Arc<Mutex<Vec<T>>>,
    changed: Arc<watch::Sender<usize>>,
}

impl<T: Clone + Send + 'static> EventRecorder<T> {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            changed: Arc::new(changed),
        }
    }

    /// Appends an event.
    pub fn record(&self, event: T) {
        let len = {
            let mut events = self.events.lock();
            events.push(event);
            events.len()
        };
        self.changed.send_replace(len);
    }

    /// Returns a listener callback that records every event it sees.
    pub fn listener(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let recorder = self.clone();
        move |event: &T| recorder.record(event.clone())
    }

    /// A copy of every event recorded so far.
    pub fn events(&self) -> Vec<T> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
        self.changed.send_replace(0);
    }

    /// Waits until `predicate` holds for the recorded events.
    ///
    /// # Panics
    ///
    /// Panics if it does not hold within [`DEFAULT_WAIT`].
    pub async fn wait_until<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&[T]) -> bool,
    {
        let mut receiver = self.changed.subscribe();
        let waited = tokio::time::timeout(DEFAULT_WAIT, async {
            loop {
                if predicate(self.events.lock().as_slice()) {
                    return;
                }
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        let events = self.events();
        assert!(
            waited.is_ok() && predicate(&events),
            "timed out waiting for events, recorded {} so far",
            events.len()
        );
        events
    }

    /// Waits until at least `count` events were recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<T> {
        self.wait_until(|events| events.len() >= count).await
    }
}

impl<T: Clone + Send + 'static> Default for EventRecorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within [`DEFAULT_WAIT`].
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(DEFAULT_WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition did not hold in time");
}
