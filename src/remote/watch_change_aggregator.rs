use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::model::{Document, DocumentKey, Timestamp};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};

/// Read-only view of target membership the aggregator consults when folding
/// stream events. Backed by the sync engine's in-memory target state.
pub trait TargetMetadataProvider {
    /// Keys the server has previously confirmed for the target.
    fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Whether the target is still being listened to. Events for targets
    /// removed mid-flight are dropped.
    fn is_active_target(&self, target_id: i32) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeType {
    Upsert,
    Remove,
}

#[derive(Debug, Default)]
struct TargetState {
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, DocumentChangeType>,
}

impl TargetState {
    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.resume_token = token.to_vec();
            self.has_pending_changes = true;
        }
    }

    fn add_document(&mut self, key: DocumentKey) {
        self.document_changes.insert(key, DocumentChangeType::Upsert);
        self.has_pending_changes = true;
    }

    fn remove_document(&mut self, key: DocumentKey) {
        self.document_changes.insert(key, DocumentChangeType::Remove);
        self.has_pending_changes = true;
    }

    fn clear_changes(&mut self) {
        self.document_changes.clear();
        self.current = false;
        self.has_pending_changes = true;
    }
}

/// Folds raw watch stream events into [`RemoteEvent`]s. Events accumulate
/// until the server publishes a snapshot version, at which point
/// [`WatchChangeAggregator::create_remote_event`] drains the pending state
/// into one consistent event.
#[derive(Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    pending_target_resets: BTreeSet<i32>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change<P: TargetMetadataProvider>(
        &mut self,
        change: &WatchChange,
        provider: &P,
    ) {
        match change {
            WatchChange::TargetChange(target_change) => {
                self.handle_target_change(target_change, provider)
            }
            WatchChange::DocumentChange {
                updated_target_ids,
                removed_target_ids,
                document,
            } => {
                for target_id in updated_target_ids {
                    if provider.is_active_target(*target_id) {
                        self.target_state(*target_id).add_document(document.key().clone());
                    }
                }
                for target_id in removed_target_ids {
                    if provider.is_active_target(*target_id) {
                        self.target_state(*target_id)
                            .remove_document(document.key().clone());
                    }
                }
                if updated_target_ids.iter().any(|id| provider.is_active_target(*id)) {
                    self.pending_document_updates
                        .insert(document.key().clone(), document.clone());
                }
            }
            WatchChange::DocumentDelete {
                removed_target_ids,
                key,
                read_time,
            } => {
                for target_id in removed_target_ids {
                    if provider.is_active_target(*target_id) {
                        self.target_state(*target_id).remove_document(key.clone());
                    }
                }
                let version = read_time.unwrap_or_default();
                self.pending_document_updates
                    .insert(key.clone(), Document::missing(key.clone(), version));
            }
            WatchChange::DocumentRemove {
                removed_target_ids,
                key,
            } => {
                for target_id in removed_target_ids {
                    if provider.is_active_target(*target_id) {
                        self.target_state(*target_id).remove_document(key.clone());
                    }
                }
            }
            WatchChange::ExistenceFilter { target_id, count } => {
                self.handle_existence_filter(*target_id, *count, provider)
            }
        }
    }

    fn handle_target_change<P: TargetMetadataProvider>(
        &mut self,
        change: &WatchTargetChange,
        provider: &P,
    ) {
        let target_ids = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };
        for target_id in target_ids {
            if !provider.is_active_target(target_id) {
                continue;
            }
            match change.state {
                TargetChangeState::NoChange | TargetChangeState::Add => {
                    self.target_state(target_id)
                        .update_resume_token(&change.resume_token);
                }
                TargetChangeState::Current => {
                    let state = self.target_state(target_id);
                    state.current = true;
                    state.has_pending_changes = true;
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Reset => {
                    self.target_state(target_id).clear_changes();
                    self.pending_target_resets.insert(target_id);
                }
                TargetChangeState::Remove => {
                    // The stream error path surfaces the cause separately;
                    // here the pending state just goes away.
                    self.target_states.remove(&target_id);
                }
            }
        }
    }

    /// Compares the server's membership count against the locally expected
    /// one. A mismatch invalidates the target's accumulated state and flags
    /// it for a full re-sync without a resume token.
    fn handle_existence_filter<P: TargetMetadataProvider>(
        &mut self,
        target_id: i32,
        count: i32,
        provider: &P,
    ) {
        if !provider.is_active_target(target_id) {
            return;
        }
        let expected = self.expected_count(target_id, provider);
        if expected != count as i64 {
            debug!(
                "existence filter mismatch for target {target_id}: server={count} local={expected}"
            );
            self.target_state(target_id).clear_changes();
            self.pending_target_resets.insert(target_id);
        }
    }

    fn expected_count<P: TargetMetadataProvider>(&self, target_id: i32, provider: &P) -> i64 {
        let mut keys = provider.remote_keys_for_target(target_id);
        if let Some(state) = self.target_states.get(&target_id) {
            for (key, change) in &state.document_changes {
                match change {
                    DocumentChangeType::Upsert => {
                        keys.insert(key.clone());
                    }
                    DocumentChangeType::Remove => {
                        keys.remove(key);
                    }
                }
            }
        }
        keys.len() as i64
    }

    /// Drains the pending state into a remote event at `snapshot_version`.
    pub fn create_remote_event<P: TargetMetadataProvider>(
        &mut self,
        snapshot_version: Timestamp,
        provider: &P,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        for (target_id, state) in &mut self.target_states {
            if !state.has_pending_changes {
                continue;
            }
            let remote_keys = provider.remote_keys_for_target(*target_id);
            let mut change = TargetChange {
                resume_token: state.resume_token.clone(),
                current: state.current,
                ..TargetChange::default()
            };
            for (key, change_type) in &state.document_changes {
                match change_type {
                    DocumentChangeType::Upsert => {
                        if remote_keys.contains(key) {
                            change.modified_documents.insert(key.clone());
                        } else {
                            change.added_documents.insert(key.clone());
                        }
                    }
                    DocumentChangeType::Remove => {
                        if remote_keys.contains(key) {
                            change.removed_documents.insert(key.clone());
                        }
                    }
                }
            }
            state.document_changes.clear();
            state.has_pending_changes = false;
            target_changes.insert(*target_id, change);
        }

        let document_updates = std::mem::take(&mut self.pending_document_updates);
        let resolved_limbo_documents = document_updates
            .iter()
            .filter(|(_, document)| !document.exists())
            .map(|(key, _)| key.clone())
            .collect();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_resets: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Forgets everything accumulated for a target, e.g. after unlisten.
    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
        self.pending_target_resets.remove(&target_id);
    }

    fn target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap as Map;

    struct FixedProvider {
        active: BTreeSet<i32>,
        remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    }

    impl TargetMetadataProvider for FixedProvider {
        fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn is_active_target(&self, target_id: i32) -> bool {
            self.active.contains(&target_id)
        }
    }

    fn provider(active: &[i32]) -> FixedProvider {
        FixedProvider {
            active: active.iter().copied().collect(),
            remote_keys: BTreeMap::new(),
        }
    }

    fn doc(path: &str, seconds: i64) -> Document {
        let mut fields = Map::new();
        fields.insert("v".to_string(), FirestoreValue::from_integer(seconds));
        Document::found(
            DocumentKey::from_string(path).unwrap(),
            Timestamp::new(seconds, 0),
            MapValue::new(fields),
        )
    }

    #[test]
    fn document_changes_accumulate_until_snapshot() {
        let provider = provider(&[1]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            &WatchChange::DocumentChange {
                updated_target_ids: vec![1],
                removed_target_ids: vec![],
                document: doc("cities/sf", 1),
            },
            &provider,
        );
        aggregator.handle_watch_change(
            &WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![1])
                    .with_resume_token(vec![9]),
            ),
            &provider,
        );

        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &provider);
        assert_eq!(event.snapshot_version, Timestamp::new(5, 0));
        let change = &event.target_changes[&1];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![9]);
        assert_eq!(change.added_documents.len(), 1);
        assert!(event
            .document_updates
            .contains_key(&DocumentKey::from_string("cities/sf").unwrap()));

        // Drained: the next event starts empty.
        let next = aggregator.create_remote_event(Timestamp::new(6, 0), &provider);
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn events_for_inactive_targets_are_dropped() {
        let provider = provider(&[1]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            &WatchChange::DocumentChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                document: doc("cities/sf", 1),
            },
            &provider,
        );
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &provider);
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());
    }

    #[test]
    fn matching_existence_filter_is_a_no_op() {
        let mut provider = provider(&[1]);
        let sf = DocumentKey::from_string("cities/sf").unwrap();
        provider
            .remote_keys
            .insert(1, [sf].into_iter().collect());
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            &WatchChange::ExistenceFilter {
                target_id: 1,
                count: 1,
            },
            &provider,
        );
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &provider);
        assert!(event.target_resets.is_empty());
    }

    #[test]
    fn mismatched_existence_filter_resets_the_target() {
        let mut provider = provider(&[1]);
        let sf = DocumentKey::from_string("cities/sf").unwrap();
        provider
            .remote_keys
            .insert(1, [sf].into_iter().collect());
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            &WatchChange::ExistenceFilter {
                target_id: 1,
                count: 3,
            },
            &provider,
        );
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &provider);
        assert!(event.target_resets.contains(&1));
    }

    #[test]
    fn deletes_produce_missing_documents_and_limbo_resolutions() {
        let mut provider = provider(&[1]);
        let sf = DocumentKey::from_string("cities/sf").unwrap();
        provider
            .remote_keys
            .insert(1, [sf.clone()].into_iter().collect());
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            &WatchChange::DocumentDelete {
                removed_target_ids: vec![1],
                key: sf.clone(),
                read_time: Some(Timestamp::new(4, 0)),
            },
            &provider,
        );
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &provider);
        let change = &event.target_changes[&1];
        assert!(change.removed_documents.contains(&sf));
        assert!(event.resolved_limbo_documents.contains(&sf));
        assert!(!event.document_updates[&sf].exists());
    }

    #[test]
    fn empty_target_id_list_addresses_all_known_targets() {
        let provider = provider(&[1, 2]);
        let mut aggregator = WatchChangeAggregator::new();
        for target_id in [1, 2] {
            aggregator.handle_watch_change(
                &WatchChange::DocumentChange {
                    updated_target_ids: vec![target_id],
                    removed_target_ids: vec![],
                    document: doc("cities/sf", 1),
                },
                &provider,
            );
        }
        aggregator.handle_watch_change(
            &WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, vec![])
                    .with_resume_token(vec![7]),
            ),
            &provider,
        );
        let event = aggregator.create_remote_event(Timestamp::new(5, 0), &provider);
        assert_eq!(event.target_changes[&1].resume_token, vec![7]);
        assert_eq!(event.target_changes[&2].resume_token, vec![7]);
    }
}
