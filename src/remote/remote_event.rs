use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Document, DocumentKey, Timestamp};

/// Accumulated effect of one target on a remote event.
#[derive(Clone, Debug, Default)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    /// Whether the server has caught the target up to the snapshot version.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

/// A consistent snapshot of watch stream activity, produced by the
/// aggregator once the server publishes a snapshot version. Everything in a
/// single event happened at or before `snapshot_version`.
#[derive(Clone, Debug, Default)]
pub struct RemoteEvent {
    pub snapshot_version: Timestamp,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose local state must be discarded and re-synced, raised by
    /// an existence filter mismatch or an explicit server reset.
    pub target_resets: BTreeSet<i32>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Limbo documents the server confirmed deleted at this version.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}
