use crate::error::FirestoreError;
use crate::model::{Document, DocumentKey, Timestamp};

/// Per-target stream state reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A target-level change on the watch stream. An empty `target_ids` list
/// addresses every active target.
#[derive(Clone, Debug)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    pub target_ids: Vec<i32>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<Timestamp>,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: Timestamp) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// One event on the watch stream.
#[derive(Clone, Debug)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    /// A document entered or changed within `updated_target_ids` and left
    /// `removed_target_ids`.
    DocumentChange {
        updated_target_ids: Vec<i32>,
        removed_target_ids: Vec<i32>,
        document: Document,
    },
    /// The server reports the document no longer exists.
    DocumentDelete {
        removed_target_ids: Vec<i32>,
        key: DocumentKey,
        read_time: Option<Timestamp>,
    },
    /// The document may still exist but no longer matches the targets.
    DocumentRemove {
        removed_target_ids: Vec<i32>,
        key: DocumentKey,
    },
    /// Server-side count of documents in the target, used to detect that the
    /// local membership view has diverged.
    ExistenceFilter {
        target_id: i32,
        count: i32,
    },
}
