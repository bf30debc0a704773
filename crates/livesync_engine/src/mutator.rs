//! Mutations with optimistic concurrency.
//!
//! Unconditional writes carry the locally known revision as a
//! precondition when the object is open, and none otherwise. A mismatch
//! comes back as [`SyncError::Conflict`].
//!
//! Mutate-with-merge reads the cached state (fetching it when the object
//! is not open), hands a copy to the caller's function, and submits the
//! result against the revision it was computed from. On conflict the
//! state is refreshed through the cache and the function runs again, up
//! to [`MutateConfig::max_attempts`](crate::MutateConfig) times.
//!
//! Mutator functions must be free of side effects: they may run more
//! than once for a single call.

use crate::cache::ObjectShared;
use crate::client::ClientInner;
use crate::error::{SyncError, SyncResult};
use livesync_protocol::{
    Command, ItemId, ItemSnapshot, JsonObject, ObjectKind, ObjectSnapshot, StreamMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The object a mutation addresses.
pub(crate) struct Target {
    pub(crate) kind: ObjectKind,
    pub(crate) reference: String,
    pub(crate) shared: Option<Arc<ObjectShared>>,
}

impl Target {
    /// Targets an object through an open handle.
    pub(crate) fn open(shared: &Arc<ObjectShared>) -> Self {
        Self {
            kind: shared.kind(),
            reference: shared.sid().to_string(),
            shared: Some(Arc::clone(shared)),
        }
    }

    /// Targets an object by SID or unique name, using the cache if it is open.
    pub(crate) fn resolve(client: &ClientInner, kind: ObjectKind, reference: &str) -> Self {
        let shared = client.cache.lookup(kind, reference);
        Self {
            kind,
            reference: shared
                .as_ref()
                .map_or_else(|| reference.to_string(), |s| s.sid().to_string()),
            shared,
        }
    }

    fn open_shared(&self) -> Option<&Arc<ObjectShared>> {
        self.shared.as_ref().filter(|s| !s.is_removed())
    }

    fn precondition(&self) -> Option<u64> {
        self.open_shared().and_then(|s| s.precondition())
    }

    fn item_precondition(&self, item_id: &ItemId) -> Option<u64> {
        self.open_shared()
            .and_then(|s| s.cached_item(item_id))
            .map(|item| item.revision)
    }
}

pub(crate) struct Mutator<'a> {
    client: &'a ClientInner,
}

impl<'a> Mutator<'a> {
    pub(crate) fn new(client: &'a ClientInner) -> Self {
        Self { client }
    }

    fn check_ttl(&self, ttl: Option<Duration>) -> SyncResult<()> {
        match ttl {
            Some(ttl) => self.client.validate_ttl(ttl),
            None => Ok(()),
        }
    }

    /// Fetches the current snapshot and applies it through the cache.
    pub(crate) async fn fetch(&self, target: &Target) -> SyncResult<ObjectSnapshot> {
        let snapshot = self
            .client
            .request(Command::Open {
                kind: target.kind,
                target: target.reference.clone(),
            })
            .await?
            .into_object()?;
        self.client.cache.apply_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    /// Replaces a document's data.
    pub(crate) async fn update_document(
        &self,
        target: &Target,
        data: JsonObject,
        ttl: Option<Duration>,
    ) -> SyncResult<ObjectSnapshot> {
        self.check_ttl(ttl)?;
        let snapshot = self
            .client
            .request(Command::UpdateDocument {
                target: target.reference.clone(),
                data,
                if_revision: target.precondition(),
                ttl,
            })
            .await?
            .into_object()?;
        self.client.cache.apply_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    /// Read-modify-write of a document.
    pub(crate) async fn mutate_document<F>(
        &self,
        target: &Target,
        ttl: Option<Duration>,
        mut mutator: F,
    ) -> SyncResult<ObjectSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        self.check_ttl(ttl)?;
        let (mut data, mut revision) = match target.open_shared() {
            Some(shared) => (shared.data(), shared.revision()),
            None => {
                let snapshot = self.fetch(target).await?;
                (snapshot.data.unwrap_or_default(), snapshot.revision)
            }
        };

        let policy = &self.client.config.mutate;
        let mut attempt = 1;
        loop {
            let candidate = mutator(data.clone()).ok_or(SyncError::Aborted)?;
            let result = self
                .client
                .request(Command::UpdateDocument {
                    target: target.reference.clone(),
                    data: candidate,
                    if_revision: Some(revision),
                    ttl,
                })
                .await
                .and_then(|reply| reply.into_object().map_err(SyncError::from));

            match result {
                Ok(snapshot) => {
                    self.client.cache.apply_snapshot(snapshot.clone());
                    return Ok(snapshot);
                }
                Err(SyncError::Conflict(message)) if attempt < policy.max_attempts => {
                    debug!(
                        target = %target.reference,
                        attempt,
                        revision,
                        "document mutation conflicted, refreshing"
                    );
                    tokio::time::sleep(policy.retry.delay_for_attempt(attempt)).await;
                    let snapshot = self.fetch(target).await?;
                    debug!(target = %target.reference, revision = snapshot.revision, %message, "refreshed");
                    data = snapshot.data.unwrap_or_default();
                    revision = snapshot.revision;
                    attempt += 1;
                }
                Err(SyncError::Conflict(message)) => {
                    return Err(SyncError::Conflict(format!(
                        "{message} (gave up after {attempt} attempts)"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Changes an object's TTL. A zero TTL clears the expiration.
    pub(crate) async fn set_ttl(&self, target: &Target, ttl: Duration) -> SyncResult<ObjectSnapshot> {
        self.client.validate_ttl(ttl)?;
        let snapshot = self
            .client
            .request(Command::SetTtl {
                kind: target.kind,
                target: target.reference.clone(),
                ttl,
                if_revision: target.precondition(),
            })
            .await?
            .into_object()?;
        self.client.cache.apply_snapshot(snapshot.clone());
        Ok(snapshot)
    }

    /// Removes an object.
    pub(crate) async fn remove(&self, target: &Target) -> SyncResult<()> {
        self.client
            .request(Command::Remove {
                kind: target.kind,
                target: target.reference.clone(),
            })
            .await?
            .into_done()?;
        if let Some(shared) = &target.shared {
            self.client.cache.apply_removed(shared.sid());
        }
        Ok(())
    }

    /// Fetches a single item.
    pub(crate) async fn get_item(&self, target: &Target, item_id: ItemId) -> SyncResult<ItemSnapshot> {
        let (item, _) = self
            .client
            .request(Command::GetItem {
                kind: target.kind,
                target: target.reference.clone(),
                item_id,
            })
            .await?
            .into_item()?;
        self.client.cache.apply_fetched_item(item.clone());
        Ok(item)
    }

    /// Appends a list item.
    pub(crate) async fn add_list_item(
        &self,
        target: &Target,
        data: JsonObject,
        ttl: Option<Duration>,
    ) -> SyncResult<ItemSnapshot> {
        self.check_ttl(ttl)?;
        let (item, _) = self
            .client
            .request(Command::AddListItem {
                target: target.reference.clone(),
                data,
                ttl,
            })
            .await?
            .into_item()?;
        self.client.cache.apply_item(item.clone(), true);
        Ok(item)
    }

    /// Replaces an item, creating it for maps.
    pub(crate) async fn set_item(
        &self,
        target: &Target,
        item_id: ItemId,
        data: JsonObject,
        ttl: Option<Duration>,
    ) -> SyncResult<ItemSnapshot> {
        self.check_ttl(ttl)?;
        let if_revision = target.item_precondition(&item_id);
        let (item, created) = self
            .client
            .request(Command::SetItem {
                kind: target.kind,
                target: target.reference.clone(),
                item_id,
                data,
                if_revision,
                ttl,
            })
            .await?
            .into_item()?;
        self.client.cache.apply_item(item.clone(), created);
        Ok(item)
    }

    /// Read-modify-write of an item.
    ///
    /// A missing map key is mutated from an empty object and created with
    /// an absence precondition, so a concurrent create is a conflict.
    pub(crate) async fn mutate_item<F>(
        &self,
        target: &Target,
        item_id: ItemId,
        ttl: Option<Duration>,
        mut mutator: F,
    ) -> SyncResult<ItemSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        self.check_ttl(ttl)?;
        let mut current = match target.open_shared().and_then(|s| s.cached_item(&item_id)) {
            Some(item) => Some(item),
            None => self.fetch_item_for_mutation(target, &item_id).await?,
        };

        let policy = &self.client.config.mutate;
        let mut attempt = 1;
        loop {
            let (data, if_revision) = match &current {
                Some(item) => (item.data.clone(), Some(item.revision)),
                None => (JsonObject::new(), Some(0)),
            };
            let candidate = mutator(data).ok_or(SyncError::Aborted)?;
            let result = self
                .client
                .request(Command::SetItem {
                    kind: target.kind,
                    target: target.reference.clone(),
                    item_id: item_id.clone(),
                    data: candidate,
                    if_revision,
                    ttl,
                })
                .await
                .and_then(|reply| reply.into_item().map_err(SyncError::from));

            match result {
                Ok((item, created)) => {
                    self.client.cache.apply_item(item.clone(), created);
                    return Ok(item);
                }
                Err(SyncError::Conflict(message)) if attempt < policy.max_attempts => {
                    debug!(
                        target = %target.reference,
                        item = %item_id,
                        attempt,
                        %message,
                        "item mutation conflicted, refreshing"
                    );
                    tokio::time::sleep(policy.retry.delay_for_attempt(attempt)).await;
                    current = self.fetch_item_for_mutation(target, &item_id).await?;
                    attempt += 1;
                }
                Err(SyncError::Conflict(message)) => {
                    return Err(SyncError::Conflict(format!(
                        "{message} (gave up after {attempt} attempts)"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_item_for_mutation(
        &self,
        target: &Target,
        item_id: &ItemId,
    ) -> SyncResult<Option<ItemSnapshot>> {
        match self.get_item(target, item_id.clone()).await {
            Ok(item) => Ok(Some(item)),
            Err(SyncError::NotFound(_)) if target.kind == ObjectKind::Map => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Removes an item.
    pub(crate) async fn remove_item(&self, target: &Target, item_id: ItemId) -> SyncResult<()> {
        let revision = self
            .client
            .request(Command::RemoveItem {
                kind: target.kind,
                target: target.reference.clone(),
                item_id: item_id.clone(),
            })
            .await?
            .into_revision()?;
        if let Some(shared) = &target.shared {
            self.client
                .cache
                .apply_item_removed(shared.sid(), item_id, revision);
        }
        Ok(())
    }

    /// Publishes a stream message. Delivery to listeners happens via push.
    pub(crate) async fn publish(&self, target: &Target, data: JsonObject) -> SyncResult<StreamMessage> {
        let message = self
            .client
            .request(Command::PublishMessage {
                target: target.reference.clone(),
                data,
            })
            .await?
            .into_message()?;
        Ok(message)
    }
}
