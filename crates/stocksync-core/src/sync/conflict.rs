//! Merge policy for pulled remote listings.
//!
//! The backend is authoritative for every key that has no local operation in
//! the queue. While an operation is queued for a key (pending or dead), the
//! cached local payload is the truth and the remote copy is ignored until the
//! operation is acknowledged.

use crate::model::Entity;

/// What to do with one cached key after a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Overwrite the cache with the remote copy.
    TakeRemote,
    /// A local operation is queued; leave the cache alone.
    KeepLocal,
    /// The key is gone remotely; drop it from the cache.
    RemoveLocal,
    /// Cache already matches the remote copy.
    Unchanged,
}

/// Decide how to merge one key.
///
/// `local` is the cached entity, `remote` the entity in the pulled listing
/// (`None` when the listing no longer contains the key), and `queued`
/// whether any local operation is still queued for the key.
pub fn decide_merge(local: Option<&Entity>, remote: Option<&Entity>, queued: bool) -> MergeDecision {
    if queued {
        return MergeDecision::KeepLocal;
    }

    match (local, remote) {
        (Some(_), None) => MergeDecision::RemoveLocal,
        (None, None) => MergeDecision::Unchanged,
        (Some(local), Some(remote)) if same_content(local, remote) => MergeDecision::Unchanged,
        (_, Some(_)) => MergeDecision::TakeRemote,
    }
}

fn same_content(local: &Entity, remote: &Entity) -> bool {
    local.payload == remote.payload && local.version == remote.version
}
