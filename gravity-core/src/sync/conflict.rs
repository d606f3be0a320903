//! Last-Write-Wins conflict resolution.

use chrono::{DateTime, Utc};

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local copy with the server's.
    AcceptRemote,
    /// Keep the local copy and resubmit it.
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Compare edit timestamps.
    ///
    /// LWW rules:
    /// 1. Later `updatedAtIso` wins.
    /// 2. Equal timestamps resolve to the server copy.
    /// 3. A side without a readable timestamp loses; if neither has one, the server wins.
    pub fn resolve(
        local_updated_at: Option<DateTime<Utc>>,
        remote_updated_at: Option<DateTime<Utc>>,
    ) -> Resolution {
        match (local_updated_at, remote_updated_at) {
            (Some(local), Some(remote)) if local > remote => Resolution::KeepLocal,
            (Some(_), None) => Resolution::KeepLocal,
            _ => Resolution::AcceptRemote,
        }
    }

    /// Whether a remote copy should replace a local note that has no queued edit.
    /// Only strictly newer remote copies are applied.
    pub fn remote_is_newer(
        local_updated_at: Option<DateTime<Utc>>,
        remote_updated_at: Option<DateTime<Utc>>,
    ) -> bool {
        match (local_updated_at, remote_updated_at) {
            (Some(local), Some(remote)) => remote > local,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}
