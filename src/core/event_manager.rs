use std::collections::BTreeMap;

use crate::core::query::Query;
use crate::core::view::ViewSnapshot;
use crate::error::FirestoreError;

/// Listener-side delivery options, mirroring the public snapshot options.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotListenOptions {
    /// Deliver snapshots that only change metadata (`from_cache`,
    /// `has_pending_writes`), not document contents.
    pub include_metadata_changes: bool,
}

pub type SnapshotCallback = Box<dyn FnMut(Result<ViewSnapshot, FirestoreError>) + Send>;
pub type SyncCallback = Box<dyn FnMut() + Send>;

/// Opaque id handed back on registration; used to remove the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerRegistration(u64);

struct QueryListener {
    id: ListenerRegistration,
    options: SnapshotListenOptions,
    callback: SnapshotCallback,
    raised_initial_event: bool,
}

impl QueryListener {
    /// Initial snapshots always fire; afterwards metadata-only snapshots
    /// are dropped unless the listener opted in.
    fn should_raise(&self, snapshot: &ViewSnapshot) -> bool {
        if !self.raised_initial_event {
            return true;
        }
        if !snapshot.changes.is_empty() || snapshot.sync_state_changed {
            return true;
        }
        self.options.include_metadata_changes
    }
}

struct ListenerGroup {
    query: Query,
    listeners: Vec<QueryListener>,
    /// Replayed to listeners that register after the first snapshot.
    last_snapshot: Option<ViewSnapshot>,
}

/// Fans query snapshots out to registered listeners and tracks global
/// snapshots-in-sync observers. Purely local bookkeeping; the sync engine
/// decides when snapshots happen.
#[derive(Default)]
pub struct EventManager {
    groups: BTreeMap<String, ListenerGroup>,
    sync_observers: BTreeMap<ListenerRegistration, SyncCallback>,
    next_id: u64,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_registration(&mut self) -> ListenerRegistration {
        self.next_id += 1;
        ListenerRegistration(self.next_id)
    }

    /// Registers a listener. Returns its registration and whether this is
    /// the first listener for the query, in which case the caller must
    /// start a watch target. Replaying a buffered snapshot to a late
    /// listener is a separate step ([`EventManager::replay_buffered`]) so
    /// the caller can schedule it like any other delivery.
    pub fn add_listener(
        &mut self,
        query: Query,
        options: SnapshotListenOptions,
        callback: SnapshotCallback,
    ) -> (ListenerRegistration, bool) {
        let id = self.next_registration();
        let canonical_id = query.canonical_id();
        let group = self
            .groups
            .entry(canonical_id)
            .or_insert_with(|| ListenerGroup {
                query,
                listeners: Vec::new(),
                last_snapshot: None,
            });
        let is_first = group.listeners.is_empty();
        group.listeners.push(QueryListener {
            id,
            options,
            callback,
            raised_initial_event: false,
        });
        (id, is_first)
    }

    /// Delivers the buffered snapshot of its query to one late listener,
    /// converted to an initial all-added snapshot. A listener that already
    /// received a snapshot (or whose query has none buffered) is left
    /// alone.
    pub fn replay_buffered(&mut self, registration: ListenerRegistration) {
        for group in self.groups.values_mut() {
            let ListenerGroup {
                listeners,
                last_snapshot,
                ..
            } = group;
            if let Some(listener) = listeners
                .iter_mut()
                .find(|listener| listener.id == registration)
            {
                if !listener.raised_initial_event {
                    if let Some(snapshot) = last_snapshot {
                        listener.raised_initial_event = true;
                        (listener.callback)(Ok(initial_snapshot(snapshot)));
                    }
                }
                return;
            }
        }
    }

    /// Removes a listener. Returns the query that no longer has listeners,
    /// if any, so the caller can stop its watch target.
    pub fn remove_listener(&mut self, registration: ListenerRegistration) -> Option<Query> {
        let mut emptied = None;
        self.groups.retain(|_, group| {
            group.listeners.retain(|listener| listener.id != registration);
            if group.listeners.is_empty() {
                emptied = Some(group.query.clone());
                false
            } else {
                true
            }
        });
        self.sync_observers.remove(&registration);
        emptied
    }

    /// Delivers a snapshot to the listeners of its query.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) {
        let Some(group) = self.groups.get_mut(&snapshot.query.canonical_id()) else {
            return;
        };
        for listener in &mut group.listeners {
            if listener.should_raise(&snapshot) {
                let delivered = if listener.raised_initial_event {
                    snapshot.clone()
                } else {
                    initial_snapshot(&snapshot)
                };
                listener.raised_initial_event = true;
                (listener.callback)(Ok(delivered));
            }
        }
        group.last_snapshot = Some(snapshot);
    }

    /// Terminal error delivery: every listener of the query receives the
    /// error once and is removed. Returns whether the query had listeners.
    pub fn on_error(&mut self, query: &Query, error: FirestoreError) -> bool {
        let Some(mut group) = self.groups.remove(&query.canonical_id()) else {
            return false;
        };
        for listener in &mut group.listeners {
            (listener.callback)(Err(error.clone()));
        }
        true
    }

    pub fn add_snapshots_in_sync_observer(
        &mut self,
        callback: SyncCallback,
    ) -> ListenerRegistration {
        let id = self.next_registration();
        self.sync_observers.insert(id, callback);
        id
    }

    /// Fired after every completed event batch, once all affected views
    /// have been notified.
    pub fn raise_snapshots_in_sync(&mut self) {
        for callback in self.sync_observers.values_mut() {
            callback();
        }
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.groups
            .get(&query.canonical_id())
            .map(|group| !group.listeners.is_empty())
            .unwrap_or(false)
    }
}

/// The first snapshot a listener sees reports every document as added,
/// regardless of the diff that produced it.
fn initial_snapshot(snapshot: &ViewSnapshot) -> ViewSnapshot {
    use crate::core::view::{ViewDocumentChange, ViewDocumentChangeType};
    let changes = snapshot
        .documents
        .iter()
        .enumerate()
        .map(|(index, document)| ViewDocumentChange {
            kind: ViewDocumentChangeType::Added,
            document: document.clone(),
            old_index: None,
            new_index: Some(index),
        })
        .collect();
    ViewSnapshot {
        query: snapshot.query.clone(),
        documents: snapshot.documents.clone(),
        changes,
        from_cache: snapshot.from_cache,
        has_pending_writes: snapshot.has_pending_writes,
        sync_state_changed: true,
    }
}
