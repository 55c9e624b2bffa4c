use std::collections::BTreeMap;

use crate::core::query::Query;
use crate::core::LimitType;
use crate::model::{Document, DocumentKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewDocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// A single document transition between two consecutive view results.
/// `old_index`/`new_index` are `None` on the side where the document is
/// absent.
#[derive(Clone, Debug)]
pub struct ViewDocumentChange {
    pub kind: ViewDocumentChangeType,
    pub document: Document,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

/// The materialized result of a query at one cache state.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: Vec<Document>,
    pub changes: Vec<ViewDocumentChange>,
    pub from_cache: bool,
    pub has_pending_writes: bool,
    pub sync_state_changed: bool,
}

/// Outcome of folding a cache update into a view.
#[derive(Clone, Debug)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
}

/// Tracks the ordered result set of one query and diffs successive results.
///
/// The view recomputes from the full candidate set on every relevant cache
/// invalidation; results are always equal to a full rescan.
#[derive(Debug)]
pub struct View {
    query: Query,
    documents: Vec<Document>,
    current: bool,
    has_emitted: bool,
}

impl View {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            documents: Vec::new(),
            current: false,
            has_emitted: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Whether the target backing this view has received a consistent
    /// snapshot from the backend.
    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Filters, orders, and limits `candidates` per the query.
    pub fn compute_result(query: &Query, candidates: &BTreeMap<DocumentKey, Document>) -> Vec<Document> {
        let mut result: Vec<Document> = candidates
            .values()
            .filter(|document| query.matches(document))
            .cloned()
            .collect();
        result.sort_by(|left, right| query.compare(left, right));

        if let Some(limit) = query.limit() {
            let limit = limit as usize;
            if result.len() > limit {
                match query.limit_type() {
                    LimitType::First => result.truncate(limit),
                    LimitType::Last => {
                        let excess = result.len() - limit;
                        result.drain(0..excess);
                    }
                }
            }
        }
        result
    }

    /// Recomputes the result from `candidates` and diffs it against the
    /// previously delivered result. Returns `None` when nothing observable
    /// changed (neither contents nor metadata).
    pub fn apply_update(
        &mut self,
        candidates: &BTreeMap<DocumentKey, Document>,
        current: bool,
    ) -> ViewChange {
        let next = Self::compute_result(&self.query, candidates);
        let changes = diff_document_lists(&self.documents, &next);

        let was_from_cache = !self.current;
        let from_cache = !current;
        let sync_state_changed = (was_from_cache != from_cache) || !self.has_emitted;

        let has_pending_writes = next.iter().any(Document::has_local_mutations);
        let had_pending_writes = self.documents.iter().any(Document::has_local_mutations);
        let metadata_changed =
            sync_state_changed || (has_pending_writes != had_pending_writes);

        if changes.is_empty() && !metadata_changed && self.has_emitted {
            self.current = current;
            self.documents = next;
            return ViewChange { snapshot: None };
        }

        self.current = current;
        self.documents = next.clone();
        self.has_emitted = true;

        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: next,
                changes,
                from_cache,
                has_pending_writes,
                sync_state_changed,
            }),
        }
    }
}

/// Full-list diff between two ordered results; classification and indices
/// are reproducible by rerunning rescan + diff.
pub fn diff_document_lists(old: &[Document], new: &[Document]) -> Vec<ViewDocumentChange> {
    let old_index: BTreeMap<&DocumentKey, usize> = old
        .iter()
        .enumerate()
        .map(|(index, doc)| (doc.key(), index))
        .collect();
    let new_index: BTreeMap<&DocumentKey, usize> = new
        .iter()
        .enumerate()
        .map(|(index, doc)| (doc.key(), index))
        .collect();

    let mut changes = Vec::new();

    for (index, document) in old.iter().enumerate() {
        if !new_index.contains_key(document.key()) {
            changes.push(ViewDocumentChange {
                kind: ViewDocumentChangeType::Removed,
                document: document.clone(),
                old_index: Some(index),
                new_index: None,
            });
        }
    }

    for (index, document) in new.iter().enumerate() {
        match old_index.get(document.key()) {
            None => changes.push(ViewDocumentChange {
                kind: ViewDocumentChangeType::Added,
                document: document.clone(),
                old_index: None,
                new_index: Some(index),
            }),
            Some(&previous_index) => {
                let previous = &old[previous_index];
                if previous != document {
                    changes.push(ViewDocumentChange {
                        kind: ViewDocumentChangeType::Modified,
                        document: document.clone(),
                        old_index: Some(previous_index),
                        new_index: Some(index),
                    });
                }
            }
        }
    }

    changes
}
