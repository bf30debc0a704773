use super::{Document, Documents};
use crate::error::SyncResult;
use livesync_protocol::{JsonObject, ObjectSnapshot};
use std::time::Duration;

impl Document {
    /// The last known document data.
    pub fn data(&self) -> JsonObject {
        self.shared.data()
    }

    /// Replaces the document data.
    ///
    /// Fails with [`SyncError::Conflict`](crate::SyncError::Conflict) if the
    /// document changed since this client last saw it.
    pub async fn set_data(&self, data: JsonObject) -> SyncResult<ObjectSnapshot> {
        self.set_data_inner(data, None).await
    }

    /// Replaces the document data and sets its TTL.
    pub async fn set_data_with_ttl(
        &self,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ObjectSnapshot> {
        self.set_data_inner(data, Some(ttl)).await
    }

    async fn set_data_inner(
        &self,
        data: JsonObject,
        ttl: Option<Duration>,
    ) -> SyncResult<ObjectSnapshot> {
        let target = self.target()?;
        self.client.mutator().update_document(&target, data, ttl).await
    }

    /// Applies `mutator` to the current data, retrying on conflict.
    ///
    /// `mutator` may run more than once and must not have side effects.
    /// Returning `None` aborts with [`SyncError::Aborted`](crate::SyncError::Aborted).
    pub async fn mutate_data<F>(&self, mutator: F) -> SyncResult<ObjectSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target()?;
        self.client
            .mutator()
            .mutate_document(&target, None, mutator)
            .await
    }

    /// Like [`mutate_data`](Self::mutate_data), also setting the TTL.
    pub async fn mutate_data_with_ttl<F>(
        &self,
        ttl: Duration,
        mutator: F,
    ) -> SyncResult<ObjectSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target()?;
        self.client
            .mutator()
            .mutate_document(&target, Some(ttl), mutator)
            .await
    }
}

impl Documents {
    /// Replaces a document's data.
    ///
    /// If the document is open locally, the known revision is used as a
    /// precondition.
    pub async fn update_document(
        &self,
        sid_or_unique_name: &str,
        data: JsonObject,
    ) -> SyncResult<ObjectSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .update_document(&target, data, None)
            .await
    }

    /// Replaces a document's data and sets its TTL.
    pub async fn update_document_with_ttl(
        &self,
        sid_or_unique_name: &str,
        data: JsonObject,
        ttl: Duration,
    ) -> SyncResult<ObjectSnapshot> {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .update_document(&target, data, Some(ttl))
            .await
    }

    /// Read-modify-write of a document, retrying on conflict.
    pub async fn mutate_document<F>(
        &self,
        sid_or_unique_name: &str,
        mutator: F,
    ) -> SyncResult<ObjectSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .mutate_document(&target, None, mutator)
            .await
    }

    /// Read-modify-write of a document that also sets its TTL.
    pub async fn mutate_document_with_ttl<F>(
        &self,
        sid_or_unique_name: &str,
        ttl: Duration,
        mutator: F,
    ) -> SyncResult<ObjectSnapshot>
    where
        F: FnMut(JsonObject) -> Option<JsonObject> + Send,
    {
        let target = self.target(sid_or_unique_name)?;
        self.client
            .mutator()
            .mutate_document(&target, Some(ttl), mutator)
            .await
    }
}
