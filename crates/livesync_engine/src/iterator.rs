//! Paged iteration over collection items.

use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;
use livesync_protocol::{Command, ItemId, ItemSnapshot, ItemsQuery, QueryOrder};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Options for an item query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Item to start from. `None` starts at the first item in order.
    pub start: Option<ItemId>,
    /// Whether the start item itself is returned.
    pub include_start: bool,
    /// Iteration order.
    pub order: QueryOrder,
    /// Items per page. `None` uses the client's configured page size.
    pub page_size: Option<u32>,
}

impl QueryOptions {
    /// Creates options for a full ascending scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the scan at `item_id`.
    pub fn starting_at(mut self, item_id: impl Into<ItemId>, inclusive: bool) -> Self {
        self.start = Some(item_id.into());
        self.include_start = inclusive;
        self
    }

    /// Iterates in descending order.
    pub fn descending(mut self) -> Self {
        self.order = QueryOrder::Descending;
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }
}

/// A lazy, forward-only sequence of collection items.
///
/// Nothing is fetched until the first [`has_next`](Self::has_next) or
/// [`next`](Self::next). From then on pages are fetched by a background
/// producer into a bounded buffer. The iterator reads the authority
/// directly: it never touches the object cache or subscriptions, so it
/// works whether or not the collection is open. Closing or dropping the
/// iterator stops the producer.
///
/// ```ignore
/// let mut items = list.query_items(QueryOptions::new())?;
/// while let Some(item) = items.next().await? {
///     println!("{} => {:?}", item.item_id, item.data);
/// }
/// ```
pub struct ItemIterator {
    source: Option<PageSource>,
    receiver: Option<mpsc::Receiver<SyncResult<ItemSnapshot>>>,
    peeked: Option<SyncResult<ItemSnapshot>>,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

struct PageSource {
    transport: Arc<dyn Transport>,
    query: ItemsQuery,
    buffer: usize,
}

impl ItemIterator {
    pub(crate) fn new(transport: Arc<dyn Transport>, query: ItemsQuery, buffer: usize) -> Self {
        Self {
            source: Some(PageSource {
                transport,
                query,
                buffer: buffer.max(1),
            }),
            receiver: None,
            peeked: None,
            producer: None,
            finished: false,
        }
    }

    /// Returns true if another item is available, fetching a page if needed.
    pub async fn has_next(&mut self) -> SyncResult<bool> {
        self.fill().await;
        match self.peeked.take() {
            Some(Err(err)) => {
                self.finish();
                Err(err)
            }
            other => {
                let available = other.is_some();
                self.peeked = other;
                Ok(available)
            }
        }
    }

    /// Returns the next item, or `None` once the sequence is exhausted.
    pub async fn next(&mut self) -> SyncResult<Option<ItemSnapshot>> {
        self.fill().await;
        match self.peeked.take() {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(err)) => {
                self.finish();
                Err(err)
            }
            None => Ok(None),
        }
    }

    /// Drains the remaining items into a vector.
    pub async fn collect_all(mut self) -> SyncResult<Vec<ItemSnapshot>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Stops the producer and discards buffered items.
    pub fn close(&mut self) {
        self.finish();
        self.peeked = None;
    }

    /// Returns true once the sequence is exhausted or closed.
    pub fn is_finished(&self) -> bool {
        self.finished && self.peeked.is_none()
    }

    /// Starts the page producer on first use.
    fn start(&mut self) {
        if let Some(source) = self.source.take() {
            let (sender, receiver) = mpsc::channel(source.buffer);
            self.producer = Some(tokio::spawn(produce(
                source.transport,
                source.query,
                sender,
            )));
            self.receiver = Some(receiver);
        }
    }

    async fn fill(&mut self) {
        if self.peeked.is_some() || self.finished {
            return;
        }
        self.start();
        let received = match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        };
        match received {
            Some(result) => self.peeked = Some(result),
            None => self.finish(),
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.source = None;
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.close();
        }
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl Drop for ItemIterator {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl std::fmt::Debug for ItemIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemIterator")
            .field("finished", &self.finished)
            .finish()
    }
}

async fn produce(
    transport: Arc<dyn Transport>,
    mut query: ItemsQuery,
    sender: mpsc::Sender<SyncResult<ItemSnapshot>>,
) {
    loop {
        let page = transport
            .request(Command::QueryItems(query.clone()))
            .await
            .and_then(|reply| reply.into_items().map_err(SyncError::from));

        let page = match page {
            Ok(page) => page,
            Err(err) => {
                let _ = sender.send(Err(err)).await;
                return;
            }
        };

        trace!(
            target = %query.target,
            items = page.items.len(),
            more = page.next_page.is_some(),
            "fetched item page"
        );
        for item in page.items {
            if sender.send(Ok(item)).await.is_err() {
                return;
            }
        }

        match page.next_page {
            Some(token) => query.page_token = Some(token),
            None => return,
        }
    }
}
