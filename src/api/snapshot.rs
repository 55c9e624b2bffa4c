use crate::api::reference::DocumentReference;
use crate::core::{Query, ViewDocumentChangeType, ViewSnapshot};
use crate::model::{Document, FieldPath};
use crate::value::{FirestoreValue, MapValue};

/// Where a snapshot's data stands relative to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// The snapshot contains writes not yet acknowledged by the backend.
    pub has_pending_writes: bool,
    /// The snapshot was served from cache rather than a live, caught-up
    /// listen.
    pub from_cache: bool,
}

/// An immutable view of one document at one point in time. Exists whether
/// or not the document does.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    reference: DocumentReference,
    document: Document,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(document: Document, metadata: SnapshotMetadata) -> Self {
        Self {
            reference: DocumentReference::from_key(document.key().clone()),
            document,
            metadata,
        }
    }

    pub fn reference(&self) -> &DocumentReference {
        &self.reference
    }

    pub fn id(&self) -> &str {
        self.reference.id()
    }

    pub fn exists(&self) -> bool {
        self.document.exists()
    }

    /// The document's fields, `None` when it does not exist.
    pub fn data(&self) -> Option<&MapValue> {
        self.document.fields()
    }

    /// A single field, `None` when absent or the document does not exist.
    pub fn get(&self, field: &FieldPath) -> Option<&FirestoreValue> {
        self.document.fields().and_then(|fields| fields.field(field))
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

impl From<ViewDocumentChangeType> for DocumentChangeType {
    fn from(kind: ViewDocumentChangeType) -> Self {
        match kind {
            ViewDocumentChangeType::Added => Self::Added,
            ViewDocumentChangeType::Modified => Self::Modified,
            ViewDocumentChangeType::Removed => Self::Removed,
        }
    }
}

/// One document transitioning between two consecutive query snapshots.
/// `old_index`/`new_index` are `None` on the side where the document is
/// absent.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub kind: DocumentChangeType,
    pub document: DocumentSnapshot,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// The results of a query at one point in time, with the diff against the
/// previously delivered snapshot.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub(crate) fn from_view_snapshot(snapshot: ViewSnapshot) -> Self {
        let metadata = SnapshotMetadata {
            has_pending_writes: snapshot.has_pending_writes,
            from_cache: snapshot.from_cache,
        };
        let documents = snapshot
            .documents
            .iter()
            .map(|document| {
                DocumentSnapshot::new(
                    document.clone(),
                    SnapshotMetadata {
                        has_pending_writes: document.has_local_mutations(),
                        from_cache: snapshot.from_cache,
                    },
                )
            })
            .collect();
        let changes = snapshot
            .changes
            .iter()
            .map(|change| DocumentChange {
                kind: change.kind.into(),
                document: DocumentSnapshot::new(
                    change.document.clone(),
                    SnapshotMetadata {
                        has_pending_writes: change.document.has_local_mutations(),
                        from_cache: snapshot.from_cache,
                    },
                ),
                old_index: change.old_index,
                new_index: change.new_index,
            })
            .collect();
        Self {
            query: snapshot.query,
            documents,
            changes,
            metadata,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Documents in query order.
    pub fn docs(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    /// The diff against the previous snapshot of the same listener.
    pub fn doc_changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    pub fn size(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }
}

impl PartialEq for QuerySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.query == other.query
            && self.metadata == other.metadata
            && self.documents == other.documents
    }
}

/// Structural equality of two snapshots of the same kind: same query or
/// reference, same contents, same metadata.
pub fn snapshots_equal<T: PartialEq>(left: &T, right: &T) -> bool {
    left == right
}
