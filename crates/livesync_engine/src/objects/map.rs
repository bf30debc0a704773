use super::{Map, Maps};
use crate::cache::ObjectEvent;
use crate::error::{SyncError, SyncResult};
use crate::iterator::{ItemIterator, QueryOptions};
use crate::listeners::ListenerId;
use livesync_protocol::{ItemId, ItemSnapshot, JsonObject};
use std::time::Duration;

fn key_id(key: &str) -> SyncResult<ItemId> {
    if key.is_empty() {
        return Err(SyncError::InvalidArgument("map keys must not be empty".into()));
    }
    Ok(ItemId::Key(key.to_string()))
}

impl Map {
    /// Fetches the item stored under `key`.
    pub async fn get_item(&self, key: &str) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client.mutator().get_item(&target, key_id(key)?).await
    }

    /// Stores `data` under `key`, creating the item if needed.
    pub async fn set_item(&self, key: &str, data: JsonObject) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client
            .mutator()
            .set_item(&target, key_id(key)?, data, None)
            .await
    }

    /// Stores `data` under `key` and sets the item TTL.
    pub async fn set_item_with_ttl(
        &self,
        key: &str,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target()?;
        self.client
            .mutator()
            .set_item(&target, key_id(key)?, data, Some(ttl))
            .await
    }

    /// Read-modify-write of the item under `key`, retrying on conflict.
    ///
    /// A missing key is mutated starting from an empty object.
    pub async fn mutate_item<F>(&self, key: &str, mutator: F) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target()?;
        self.client
            .mutator()
            .mutate_item(&target, key_id(key)?, None, mutator)
            .await
    }

    /// Like [`mutate_item`](Self::mutate_item), also setting the item TTL.
    pub async fn mutate_item_with_ttl<F>(
        &self,
        key: &str,
        ttl: Duration,
        mutator: F,
    ) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target()?;
        self.client
            .mutator()
            .mutate_item(&target, key_id(key)?, Some(ttl), mutator)
            .await
    }

    /// Removes the item under `key`.
    pub async fn remove_item(&self, key: &str) -> SyncResult<()> {
        let target = self.target()?;
        self.client.mutator().remove_item(&target, key_id(key)?).await
    }

    /// Iterates over the map's items, by ascending key unless configured
    /// otherwise.
    pub fn query_items(&self, options: QueryOptions) -> SyncResult<ItemIterator> {
        let target = self.target()?;
        self.client.query_items(&target, options)
    }

    /// Listens for new keys.
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

    /// Listens for replaced values.
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

    /// Listens for removed keys.
    pub fn on_item_removed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str, Option<&ItemSnapshot>) + Send + Sync + 'static,
    {
        self.listen(move |event| {
            if let ObjectEvent::ItemRemoved {
                item_id: ItemId::Key(key),
                previous,
            } = event
            {
                callback(key, previous.as_ref());
            }
        })
    }
}

impl Maps {
    /// Fetches one item.
    pub async fn get_map_item(&self, sid_or_unique_name: &str, key: &str) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client.mutator().get_item(&target, key_id(key)?).await
    }

    /// Stores `data` under `key`.
    pub async fn set_map_item(
        &self,
        sid_or_unique_name: &str,
        key: &str,
        data: JsonObject,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .set_item(&target, key_id(key)?, data, None)
            .await
    }

    /// Stores `data` under `key` and sets the item TTL.
    pub async fn set_map_item_with_ttl(
        &self,
        sid_or_unique_name: &str,
        key: &str,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ItemSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .set_item(&target, key_id(key)?, data, Some(ttl))
            .await
    }

    /// Read-modify-write of one item, retrying on conflict.
    pub async fn mutate_map_item<F>(
        &self,
        sid_or_unique_name: &str,
        key: &str,
        mutator: F,
    ) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .mutate_item(&target, key_id(key)?, None, mutator)
            .await
    }

    /// Read-modify-write of one item that also sets its TTL.
    pub async fn mutate_map_item_with_ttl<F>(
        &self,
        sid_or_unique_name: &str,
        key: &str,
        ttl: Duration,
        mutator: F,
    ) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .mutate_item(&target, key_id(key)?, Some(ttl), mutator)
            .await
    }

    /// Removes one item.
    pub async fn remove_map_item(&self, sid_or_unique_name: &str, key: &str) -> SyncResult<()> {
        let target = self.target(sid_or_unique_name)?;
        self.client.mutator().remove_item(&target, key_id(key)?).await
    }

    /// Iterates over a map's items without opening it.
    pub fn query_items(
        &self,
        sid_or_unique_name: &str,
        options: QueryOptions,
    ) -> SyncResult<ItemIterator> {
        let target = self.target(sid_or_unique_name)?;
        self.client.query_items(&target, options)
    }
}
