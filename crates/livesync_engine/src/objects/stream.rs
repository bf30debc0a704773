use super::{Stream, Streams};
use crate::cache::ObjectEvent;
use crate::error::SyncResult;
use crate::listeners::ListenerId;
use livesync_protocol::{JsonObject, StreamMessage};

impl Stream {
    /// Publishes a message to every subscriber, this client included.
    ///
    /// Messages are not stored; listeners registered later never see it.
    pub async fn publish_message(&self, data: JsonObject) -> SyncResult<StreamMessage> {
        let target = self.target()?;
        self.client.mutator().publish(&target, data).await
    }

    /// Listens for published messages.
    pub fn on_message_published<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::MessagePublished(message) = event {
                callback(message);
            }
        })
    }
}

impl Streams {
    /// Publishes a message without opening the stream.
    pub async fn publish_message(
        &self,
        sid_or_unique_name: &str,
        data: JsonObject,
    ) -> SyncResult<StreamMessage> {
        let target = self.target(sid_or_unique_name)?;
        self.client.mutator().publish(&target, data).await
    }
}
