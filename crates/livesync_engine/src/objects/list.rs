use super::{List, Lists};
use crate::cache::ObjectEvent;
use crate::error::SyncResult;
use crate::iterator::{ItemIterator, QueryOptions};
use crate::listeners::ListenerId;
use livesync_protocol::{ItemId, ItemSnapshot, JsonObject};
use std::time::Duration;

impl List {
    /// Appends an item. The authority assigns the next index.
    pub async fn add_item(&self, data: JsonObject) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client.mutator().add_list_item(&target, data, None).await
    }

    /// Appends an item that expires after `ttl`.
    pub async fn add_item_with_ttl(
        &self,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client
            .mutator()
            .add_list_item(&target, data, Some(ttl))
            .await
    }

    /// Fetches the item at `index`.
    pub async fn get_item(&self, index: u64) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client
            .mutator()
            .get_item(&target, ItemId::Index(index))
            .await
    }

    /// Replaces the item at `index`.
    pub async fn set_item(&self, index: u64, data: JsonObject) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client
            .mutator()
            .set_item(&target, ItemId::Index(index), data, None)
            .await
    }

    /// Replaces the item at `index` and sets its TTL.
    pub async fn set_item_with_ttl(
        &self,
        index: u64,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client
            .mutator()
            .set_item(&target, ItemId::Index(index), data, Some(ttl))
            .await
    }

    /// Read-modify-write of the item at `index`, retrying on conflict.
    pub async fn mutate_item<F>(&self, index: u64, mutator: F) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target()?;
        self.client
            .mutator()
            .mutate_item(&target, ItemId::Index(index), None, mutator)
            .await
    }

    /// Like [`mutate_item`](Self::mutate_item), also setting the item TTL.
    pub async fn mutate_item_with_ttl<F>(
        &self,
        index: u64,
        ttl: Duration,
        mutator: F,
    ) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target()?;
        self.client
            .mutator()
            .mutate_item(&target, ItemId::Index(index), Some(ttl), mutator)
            .await
    }

    /// Removes the item at `index`. Indices are never reused.
    pub async fn remove_item(&self, index: u64) -> SyncResult<()> {
        let target = self.target()?;
        self.client
            .mutator()
            .remove_item(&target, ItemId::Index(index))
            .await
    }

    /// Iterates over the list's items, by ascending index unless configured
    /// otherwise.
    pub fn query_items(&self, options: QueryOptions) -> SyncResult<ItemIterator> {
        let target = self.target()?;
        self.client.query_items(&target, options)
    }

    /// Listens for appended items.
    pub fn on_item_added<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ItemSnapshot) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::ItemAdded(item) = event {
                callback(item);
            }
        })
    }

    /// Listens for replaced items.
    pub fn on_item_updated<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ItemSnapshot) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::ItemUpdated(item) = event {
                callback(item);
            }
        })
    }

    /// Listens for removed items. The callback receives the index and the
    /// item's last cached state, if any.
    pub fn on_item_removed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(u64, Option<&ItemSnapshot>) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::ItemRemoved {
                item_id: ItemId::Index(index),
                previous,
            } = event
            {
                callback(*index, previous.as_ref());
            }
        })
    }
}

impl Lists {
    /// Appends an item to a list.
    pub async fn add_list_item(
        &self,
        sid_or_unique_name: &str,
        data: JsonObject,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client.mutator().add_list_item(&target, data, None).await
    }

    /// Appends an item that expires after `ttl`.
    pub async fn add_list_item_with_ttl(
        &self,
        sid_or_unique_name: &str,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .add_list_item(&target, data, Some(ttl))
            .await
    }

    /// Fetches one item.
    pub async fn get_list_item(
        &self,
        sid_or_unique_name: &str,
        index: u64,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .get_item(&target, ItemId::Index(index))
            .await
    }

    /// Replaces one item.
    pub async fn set_list_item(
        &self,
        sid_or_unique_name: &str,
        index: u64,
        data: JsonObject,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .set_item(&target, ItemId::Index(index), data, None)
            .await
    }

    /// Replaces one item and sets its TTL.
    pub async fn set_list_item_with_ttl(
        &self,
        sid_or_unique_name: &str,
        index: u64,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .set_item(&target, ItemId::Index(index), data, Some(ttl))
            .await
    }

    /// Read-modify-write of one item, retrying on conflict.
    pub async fn mutate_list_item<F>(
        &self,
        sid_or_unique_name: &str,
        index: u64,
        mutator: F,
    ) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .mutate_item(&target, ItemId::Index(index), None, mutator)
            .await
    }

    /// Removes one item.
    pub async fn remove_list_item(&self, sid_or_unique_name: &str, index: u64) -> SyncResult<()> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .remove_item(&target, ItemId::Index(index))
            .await
    }

    /// Iterates over a list's items without opening it.
    pub fn query_items(
        &self,
        sid_or_unique_name: &str,
        options: QueryOptions,
    ) -> SyncResult<ItemIterator> {
        let target = self.target(sid_or_unique_name)?;
        self.client.query_items(&target, options)
    }
}
