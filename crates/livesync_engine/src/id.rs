//! Object identity.

use livesync_protocol::Sid;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a synchronized object.
///
/// Equality and hashing use the SID only; the unique name is a lookup
/// alias and may be absent.
#[derive(Debug, Clone)]
pub struct SyncObjectId {
    sid: Sid,
    unique_name: Option<String>,
}

impl SyncObjectId {
    /// Creates a new identity.
    pub fn new(sid: Sid, unique_name: Option<String>) -> Self {
        Self { sid, unique_name }
    }

    /// Returns the SID.
    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    /// Returns the unique name, if any.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }
}

impl PartialEq for SyncObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.sid == other.sid
    }
}

impl Eq for SyncObjectId {}

impl Hash for SyncObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sid.hash(state);
    }
}

impl fmt::Display for SyncObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unique_name {
            Some(name) => write!(f, "{} ({name})", self.sid),
            None => write!(f, "{}", self.sid),
        }
    }
}
