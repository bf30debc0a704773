//! Token providers backed by an in-process authority.

use crate::loopback::to_sync_error;
use async_trait::async_trait;
use livesync_engine::{SyncError, SyncResult, TokenProvider};
use livesync_server::Authority;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Issues tokens for one identity from an [`Authority`], counting fetches.
#[derive(Debug)]
pub struct AuthorityTokenProvider {
    authority: Arc<Authority>,
    identity: String,
    fetches: AtomicUsize,
    unavailable: AtomicBool,
}

impl AuthorityTokenProvider {
    /// Creates a provider issuing tokens for `identity`.
    pub fn new(authority: Arc<Authority>, identity: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            authority,
            identity: identity.into(),
            fetches: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        })
    }

    /// The identity tokens are issued for.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Number of tokens fetched so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Makes later fetches fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenProvider for AuthorityTokenProvider {
    async fn fetch_token(&self) -> SyncResult<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("token service unavailable"));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.authority
            .issue_token(&self.identity)
            .map_err(to_sync_error)
    }
}
