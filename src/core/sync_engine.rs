use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_lock::Mutex;
use futures::channel::oneshot;
use log::{debug, warn};

use crate::core::event_manager::{
    EventManager, ListenerRegistration, SnapshotCallback, SnapshotListenOptions, SyncCallback,
};
use crate::core::query::Query;
use crate::core::view::{View, ViewSnapshot};
use crate::error::{aborted, FirestoreError, FirestoreResult};
use crate::local::{LocalStore, QueryResult};
use crate::model::{Document, DocumentKey, Mutation, MutationBatchResult, Timestamp};
use crate::remote::{
    RemoteEvent, RemoteStore, TargetChangeState, TargetMetadataProvider, WatchChange,
    WatchChangeAggregator,
};

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

struct EngineState {
    aggregator: WatchChangeAggregator,
    views: BTreeMap<i32, QueryView>,
    targets_by_query: BTreeMap<String, i32>,
    /// In-memory mirror of each target's server-confirmed membership.
    remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    current_targets: BTreeSet<i32>,
    limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    limbo_keys_by_target: BTreeMap<i32, DocumentKey>,
    pending_write_callbacks: BTreeMap<i32, oneshot::Sender<FirestoreResult<()>>>,
    network_enabled: bool,
}

struct ProviderView<'a> {
    remote_keys: &'a BTreeMap<i32, BTreeSet<DocumentKey>>,
    views: &'a BTreeMap<i32, QueryView>,
    limbo_keys_by_target: &'a BTreeMap<i32, DocumentKey>,
}

impl TargetMetadataProvider for ProviderView<'_> {
    fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.remote_keys.get(&target_id).cloned().unwrap_or_default()
    }

    fn is_active_target(&self, target_id: i32) -> bool {
        self.views.contains_key(&target_id)
            || self.limbo_keys_by_target.contains_key(&target_id)
    }
}

/// One scheduled listener delivery. The engine produces these under its
/// state lock; the event delivery task consumes them in order.
enum EventTask {
    Snapshot(ViewSnapshot),
    QueryError { query: Query, error: FirestoreError },
    Replay(ListenerRegistration),
    SnapshotsInSync,
}

/// The heart of the client: routes local writes, remote events, and target
/// lifecycle between the local store, the remote store, and the event
/// manager.
///
/// Engine operations run under one engine-wide async mutex, so state
/// changes are strictly serialized. Listener callbacks never run inside an
/// engine operation: deliveries are posted to an in-order queue and
/// dispatched by a dedicated task, and the write pipeline commits batches
/// from its own task without holding the state lock across the round trip.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    state: Mutex<EngineState>,
    events: Arc<Mutex<EventManager>>,
    event_queue: async_channel::Sender<EventTask>,
    write_signal_tx: async_channel::Sender<()>,
    write_signal_rx: async_channel::Receiver<()>,
}

impl SyncEngine {
    /// Must be called from within a tokio runtime: the delivery task is
    /// spawned here and lives until the engine is dropped.
    pub fn new(local_store: Arc<LocalStore>, remote_store: Arc<RemoteStore>) -> Self {
        let events = Arc::new(Mutex::new(EventManager::new()));
        let (event_queue, event_rx) = async_channel::unbounded();
        // Detached on purpose: the task exits once the engine (the only
        // sender) is dropped.
        let _ = spawn_event_delivery(Arc::clone(&events), event_rx);
        let (write_signal_tx, write_signal_rx) = async_channel::bounded(1);
        Self {
            local_store,
            remote_store,
            state: Mutex::new(EngineState {
                aggregator: WatchChangeAggregator::new(),
                views: BTreeMap::new(),
                targets_by_query: BTreeMap::new(),
                remote_keys: BTreeMap::new(),
                current_targets: BTreeSet::new(),
                limbo_targets_by_key: BTreeMap::new(),
                limbo_keys_by_target: BTreeMap::new(),
                pending_write_callbacks: BTreeMap::new(),
                network_enabled: true,
            }),
            events,
            event_queue,
            write_signal_tx,
            write_signal_rx,
        }
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    /// Spawns the task that pumps watch events from the datastore into the
    /// engine. Runs until the datastore's event channel closes.
    pub fn spawn_watch_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let events = engine.remote_store.watch_events();
        tokio::spawn(async move {
            while let Ok(change) = events.recv().await {
                if let Err(err) = engine.handle_watch_change(change).await {
                    warn!("failed to process watch event: {err}");
                }
            }
        })
    }

    /// Spawns the task that drains the mutation queue. Each wake commits
    /// queued batches one at a time; the state lock is never held across a
    /// commit, so listeners and other entry points keep running while a
    /// batch is in flight.
    pub fn spawn_write_pipeline(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let signal = self.write_signal_rx.clone();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while signal.recv().await.is_ok() {
                if let Err(err) = engine.fill_write_pipeline().await {
                    warn!("write pipeline stalled: {err}");
                }
            }
        })
    }

    /// Wakes the write pipeline task. Capacity one: a wake that is already
    /// pending covers this notification.
    pub fn notify_write_pipeline(&self) {
        let _ = self.write_signal_tx.try_send(());
    }

    fn post(&self, task: EventTask) {
        // Unbounded queue: sending only fails once the delivery task is
        // gone, at which point there is nobody left to notify.
        let _ = self.event_queue.try_send(task);
    }

    /// Registers a snapshot listener. The first listener for a query raises
    /// a snapshot from cache and starts a watch target; later listeners get
    /// the buffered snapshot. Either way the delivery is scheduled, never
    /// run inside this call.
    pub async fn listen(
        &self,
        query: Query,
        options: SnapshotListenOptions,
        callback: SnapshotCallback,
    ) -> FirestoreResult<ListenerRegistration> {
        let (registration, is_first) = self
            .events
            .lock()
            .await
            .add_listener(query.clone(), options, callback);
        if is_first {
            let target = {
                let mut state = self.state.lock().await;
                let target = self.local_store.allocate_target(&query).await?;
                let target_id = target.target_id();
                state
                    .targets_by_query
                    .insert(query.canonical_id(), target_id);
                let remote_keys = self
                    .local_store
                    .target_metadata(target_id)
                    .await
                    .map(|metadata| metadata.remote_keys)
                    .unwrap_or_default();
                state.remote_keys.insert(target_id, remote_keys);

                let mut view = View::new(query.clone());
                let result = self.local_store.execute_query(&query).await?;
                let change = view.apply_update(&result.documents, false);
                state.views.insert(
                    target_id,
                    QueryView {
                        query,
                        target_id,
                        view,
                    },
                );
                if let Some(snapshot) = change.snapshot {
                    self.post(EventTask::Snapshot(snapshot));
                }
                self.post(EventTask::SnapshotsInSync);
                target
            };
            self.remote_store.listen(target).await?;
        } else {
            self.post(EventTask::Replay(registration));
        }
        Ok(registration)
    }

    /// Drops a listener. Stopping the last listener of a query stops its
    /// watch target; the persisted resume token survives for a re-listen.
    pub async fn unlisten(&self, registration: ListenerRegistration) -> FirestoreResult<()> {
        let emptied = self.events.lock().await.remove_listener(registration);
        if let Some(query) = emptied {
            let mut state = self.state.lock().await;
            if let Some(target_id) = state.targets_by_query.remove(&query.canonical_id()) {
                state.views.remove(&target_id);
                state.remote_keys.remove(&target_id);
                state.current_targets.remove(&target_id);
                state.aggregator.remove_target(target_id);
                self.remote_store.unlisten(target_id).await?;
            }
        }
        Ok(())
    }

    pub async fn add_snapshots_in_sync_observer(
        &self,
        callback: SyncCallback,
    ) -> ListenerRegistration {
        self.events
            .lock()
            .await
            .add_snapshots_in_sync_observer(callback)
    }

    /// Stages mutations locally, schedules snapshots for affected views,
    /// and wakes the write pipeline. Returns as soon as the batch is
    /// staged; the receiver resolves once the backend acknowledges or
    /// rejects it.
    pub async fn write(
        &self,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<(i32, oneshot::Receiver<FirestoreResult<()>>)> {
        let batch_id;
        let receiver;
        {
            let mut state = self.state.lock().await;
            let (batch, _changed) = self.local_store.write_locally(mutations).await?;
            batch_id = batch.batch_id;
            let (sender, r) = oneshot::channel();
            receiver = r;
            state.pending_write_callbacks.insert(batch_id, sender);
            self.emit_view_changes(&mut state).await?;
            self.post(EventTask::SnapshotsInSync);
        }
        self.notify_write_pipeline();
        Ok((batch_id, receiver))
    }

    /// Commits queued batches in order until the queue drains or the
    /// network is disabled. Rejected batches are dropped, never retried.
    /// Only the write pipeline task calls this, so a batch is never
    /// committed twice.
    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        loop {
            let batch = {
                let state = self.state.lock().await;
                if !state.network_enabled {
                    return Ok(());
                }
                match self.local_store.next_batch_after(0).await {
                    Some(batch) => batch,
                    None => return Ok(()),
                }
            };
            // The state lock is released for the duration of the commit.
            let outcome = self.remote_store.commit(&batch.mutations).await;
            let mut state = self.state.lock().await;
            match outcome {
                Ok((commit_version, mutation_results)) => {
                    let result =
                        MutationBatchResult::new(batch.batch_id, commit_version, mutation_results);
                    self.local_store.acknowledge_batch(&result).await?;
                    if let Some(sender) = state.pending_write_callbacks.remove(&batch.batch_id) {
                        let _ = sender.send(Ok(()));
                    }
                }
                Err(err) => {
                    warn!("batch {} rejected: {err}", batch.batch_id);
                    self.local_store.reject_batch(batch.batch_id).await?;
                    if let Some(sender) = state.pending_write_callbacks.remove(&batch.batch_id) {
                        let _ = sender.send(Err(err));
                    }
                }
            }
            self.emit_view_changes(&mut state).await?;
            self.post(EventTask::SnapshotsInSync);
        }
    }

    /// Resolves once every write pending at the time of the call has been
    /// acknowledged or rejected. Writes issued afterwards do not delay it.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        match self.local_store.pending_writes_signal().await {
            None => Ok(()),
            Some(receiver) => receiver.await.map_err(|_| {
                aborted("Client shut down before pending writes completed")
            }),
        }
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.network_enabled {
                return Ok(());
            }
            state.network_enabled = true;
            self.remote_store.enable_network().await?;
        }
        self.notify_write_pipeline();
        Ok(())
    }

    /// Takes the client offline: streams stop, views fall back to cache,
    /// queued writes wait for the network to come back.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.network_enabled {
            return Ok(());
        }
        state.network_enabled = false;
        state.current_targets.clear();
        self.remote_store.disable_network().await?;
        self.emit_view_changes(&mut state).await?;
        self.post(EventTask::SnapshotsInSync);
        Ok(())
    }

    pub async fn is_network_enabled(&self) -> bool {
        self.state.lock().await.network_enabled
    }

    /// Cache-only document read with pending mutations applied.
    pub async fn read_document_from_cache(
        &self,
        key: &DocumentKey,
    ) -> FirestoreResult<Document> {
        self.local_store.read_document(key).await
    }

    /// Cache-only query execution with pending mutations applied.
    pub async fn execute_query_from_cache(&self, query: &Query) -> FirestoreResult<QueryResult> {
        self.local_store.execute_query(query).await
    }

    /// Folds documents fetched through a direct backend read into the cache
    /// and refreshes affected views. Stale versions are dropped by the
    /// cache's newer-wins rule.
    pub async fn apply_backend_read(&self, documents: Vec<Document>) -> FirestoreResult<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let mut event = RemoteEvent::default();
        for document in documents {
            event.snapshot_version = event.snapshot_version.max(document.version());
            event.document_updates.insert(document.key().clone(), document);
        }
        self.local_store.apply_remote_event(&event).await?;
        self.emit_view_changes(&mut state).await?;
        self.post(EventTask::SnapshotsInSync);
        Ok(())
    }

    pub async fn has_active_listeners(&self) -> bool {
        !self.state.lock().await.views.is_empty()
    }

    /// One watch stream event. Target removals carrying an error reject the
    /// listen; a target change with a read time closes a snapshot and
    /// applies the accumulated remote event.
    pub async fn handle_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    for target_id in target_change.target_ids.clone() {
                        self.handle_rejected_listen(&mut state, target_id, cause.clone())
                            .await?;
                    }
                    self.post(EventTask::SnapshotsInSync);
                    return Ok(());
                }
            }
            for target_id in &target_change.target_ids {
                self.remote_store.mark_target_active(*target_id).await;
            }
        }

        {
            let EngineState {
                aggregator,
                views,
                remote_keys,
                limbo_keys_by_target,
                ..
            } = &mut *state;
            let provider = ProviderView {
                remote_keys,
                views,
                limbo_keys_by_target,
            };
            aggregator.handle_watch_change(&change, &provider);
        }

        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(read_time) = target_change.read_time {
                let event = {
                    let EngineState {
                        aggregator,
                        views,
                        remote_keys,
                        limbo_keys_by_target,
                        ..
                    } = &mut *state;
                    let provider = ProviderView {
                        remote_keys,
                        views,
                        limbo_keys_by_target,
                    };
                    aggregator.create_remote_event(read_time, &provider)
                };
                self.apply_remote_event(&mut state, event).await?;
            }
        }
        Ok(())
    }

    async fn apply_remote_event(
        &self,
        state: &mut EngineState,
        event: RemoteEvent,
    ) -> FirestoreResult<()> {
        self.local_store.apply_remote_event(&event).await?;

        for (target_id, change) in &event.target_changes {
            let keys = state.remote_keys.entry(*target_id).or_default();
            for key in change
                .added_documents
                .iter()
                .chain(change.modified_documents.iter())
            {
                keys.insert(key.clone());
            }
            for key in &change.removed_documents {
                keys.remove(key);
            }
            if change.current {
                state.current_targets.insert(*target_id);
            }
        }

        for target_id in &event.target_resets {
            state.remote_keys.entry(*target_id).or_default().clear();
            state.current_targets.remove(target_id);
            self.remote_store.restart_target(*target_id).await?;
        }

        let resolved: Vec<DocumentKey> = event
            .resolved_limbo_documents
            .iter()
            .filter(|key| state.limbo_targets_by_key.contains_key(*key))
            .cloned()
            .collect();
        for key in resolved {
            if let Some(target_id) = state.limbo_targets_by_key.remove(&key) {
                debug!("limbo document {} resolved as deleted", key.canonical_string());
                state.limbo_keys_by_target.remove(&target_id);
                state.remote_keys.remove(&target_id);
                state.current_targets.remove(&target_id);
                state.aggregator.remove_target(target_id);
                self.remote_store.unlisten(target_id).await?;
                self.local_store.release_target(target_id).await?;
            }
        }

        self.emit_view_changes(state).await?;
        self.update_limbo_targets(state).await?;
        self.post(EventTask::SnapshotsInSync);
        Ok(())
    }

    /// A target the server refuses. Limbo targets treat the rejection as a
    /// deletion; query targets deliver the terminal error to listeners.
    async fn handle_rejected_listen(
        &self,
        state: &mut EngineState,
        target_id: i32,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        if let Some(key) = state.limbo_keys_by_target.remove(&target_id) {
            state.limbo_targets_by_key.remove(&key);
            state.remote_keys.remove(&target_id);
            state.aggregator.remove_target(target_id);
            self.remote_store.unlisten(target_id).await?;
            self.local_store.release_target(target_id).await?;
            // The backend will not tell us about this document; assume it
            // is gone so the view converges.
            let mut event = RemoteEvent {
                snapshot_version: Timestamp::now(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                Document::missing(key, Timestamp::now()),
            );
            self.local_store.apply_remote_event(&event).await?;
            self.emit_view_changes(state).await?;
            return Ok(());
        }

        let Some(query_view) = state.views.remove(&target_id) else {
            return Ok(());
        };
        warn!(
            "listen for target {target_id} rejected: {error}"
        );
        state
            .targets_by_query
            .remove(&query_view.query.canonical_id());
        state.remote_keys.remove(&target_id);
        state.current_targets.remove(&target_id);
        state.aggregator.remove_target(target_id);
        self.post(EventTask::QueryError {
            query: query_view.query,
            error,
        });
        self.remote_store.unlisten(target_id).await?;
        self.local_store.release_target(target_id).await
    }

    /// Recomputes every active view from local state and schedules the
    /// resulting snapshots for delivery. A view is `current` once its
    /// target caught up and the network is enabled.
    async fn emit_view_changes(&self, state: &mut EngineState) -> FirestoreResult<()> {
        let EngineState {
            views,
            current_targets,
            network_enabled,
            ..
        } = &mut *state;
        for query_view in views.values_mut() {
            let result = self.local_store.execute_query(&query_view.query).await?;
            let current = *network_enabled && current_targets.contains(&query_view.target_id);
            if let Some(snapshot) = query_view
                .view
                .apply_update(&result.documents, current)
                .snapshot
            {
                self.post(EventTask::Snapshot(snapshot));
            }
        }
        Ok(())
    }

    /// Documents still shown by a current view but absent from the server's
    /// membership are in limbo: their true state is unknown. Each gets a
    /// dedicated single-document target until the server settles it.
    async fn update_limbo_targets(&self, state: &mut EngineState) -> FirestoreResult<()> {
        let mut candidates = Vec::new();
        for query_view in state.views.values() {
            if !state.current_targets.contains(&query_view.target_id) {
                continue;
            }
            let remote = state.remote_keys.get(&query_view.target_id);
            for document in query_view.view.documents() {
                if document.has_local_mutations() {
                    continue;
                }
                let confirmed = remote
                    .map(|keys| keys.contains(document.key()))
                    .unwrap_or(false);
                if !confirmed && !state.limbo_targets_by_key.contains_key(document.key()) {
                    candidates.push(document.key().clone());
                }
            }
        }
        for key in candidates {
            let target = self
                .local_store
                .allocate_target(&Query::document(key.clone()))
                .await?;
            debug!("tracking limbo document {}", key.canonical_string());
            state
                .limbo_targets_by_key
                .insert(key.clone(), target.target_id());
            state.limbo_keys_by_target.insert(target.target_id(), key);
            self.remote_store.listen(target).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn limbo_document_count(&self) -> usize {
        self.state.lock().await.limbo_targets_by_key.len()
    }
}

/// Listener callbacks run on this task, one event at a time, in the order
/// the engine produced them. Exits once the engine (the only sender) is
/// dropped.
fn spawn_event_delivery(
    events: Arc<Mutex<EventManager>>,
    queue: async_channel::Receiver<EventTask>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(task) = queue.recv().await {
            let mut events = events.lock().await;
            match task {
                EventTask::Snapshot(snapshot) => events.on_view_snapshot(snapshot),
                EventTask::QueryError { query, error } => {
                    events.on_error(&query, error);
                }
                EventTask::Replay(registration) => events.replay_buffered(registration),
                EventTask::SnapshotsInSync => events.raise_snapshots_in_sync(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryPersistence;
    use crate::model::ResourcePath;
    use crate::remote::{FakeDatastore, WatchTargetChange};
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn engine_with_datastore() -> (Arc<SyncEngine>, Arc<FakeDatastore>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let local_store = Arc::new(LocalStore::load(persistence).await.unwrap());
        let datastore = Arc::new(FakeDatastore::new());
        let remote_store = Arc::new(RemoteStore::new(datastore.clone()));
        let engine = Arc::new(SyncEngine::new(local_store, remote_store));
        // Dropping the handle detaches the task; it exits with the runtime.
        let _ = engine.spawn_write_pipeline();
        (engine, datastore)
    }

    /// Lets the delivery and pipeline tasks drain their queues.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn cities() -> Query {
        Query::collection(ResourcePath::from_string("cities").unwrap()).unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn fields(population: i64) -> MapValue {
        let mut map = Map::new();
        map.insert(
            "population".to_string(),
            FirestoreValue::from_integer(population),
        );
        MapValue::new(map)
    }

    fn recording() -> (
        Arc<StdMutex<Vec<Result<ViewSnapshot, FirestoreError>>>>,
        SnapshotCallback,
    ) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let callback: SnapshotCallback =
            Box::new(move |event| sink.lock().unwrap().push(event));
        (events, callback)
    }

    #[tokio::test]
    async fn listen_raises_an_initial_snapshot_from_cache() {
        let (engine, _) = engine_with_datastore().await;
        let (events, callback) = recording();
        engine
            .listen(cities(), SnapshotListenOptions::default(), callback)
            .await
            .unwrap();
        settle().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let snapshot = events[0].as_ref().unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.documents.is_empty());
    }

    #[tokio::test]
    async fn listen_returns_before_the_initial_snapshot_is_delivered() {
        let (engine, _) = engine_with_datastore().await;
        let (events, callback) = recording();
        engine
            .listen(cities(), SnapshotListenOptions::default(), callback)
            .await
            .unwrap();
        // Nothing has run the delivery yet on this single-threaded
        // runtime; the snapshot arrives once the delivery task is polled.
        assert!(events.lock().unwrap().is_empty());
        settle().await;
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_write_is_reflected_before_acknowledgement() {
        let (engine, _) = engine_with_datastore().await;
        engine.disable_network().await.unwrap();
        let (events, callback) = recording();
        engine
            .listen(cities(), SnapshotListenOptions::default(), callback)
            .await
            .unwrap();

        engine
            .write(vec![Mutation::set(key("cities/sf"), fields(100))])
            .await
            .unwrap();
        settle().await;

        let events = events.lock().unwrap();
        let latest = events.last().unwrap().as_ref().unwrap();
        assert_eq!(latest.documents.len(), 1);
        assert!(latest.has_pending_writes);
        assert!(latest.from_cache);
    }

    #[tokio::test]
    async fn watch_current_flips_the_view_out_of_cache() {
        let (engine, datastore) = engine_with_datastore().await;
        let (events, callback) = recording();
        engine
            .listen(cities(), SnapshotListenOptions::default(), callback)
            .await
            .unwrap();
        let target_id = datastore.listened_targets().await[0];

        engine
            .handle_watch_change(WatchChange::DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: vec![],
                document: Document::found(key("cities/sf"), Timestamp::new(5, 0), fields(1)),
            })
            .await
            .unwrap();
        engine
            .handle_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                    .with_resume_token(vec![1])
                    .with_read_time(Timestamp::new(5, 0)),
            ))
            .await
            .unwrap();
        settle().await;

        let events = events.lock().unwrap();
        let latest = events.last().unwrap().as_ref().unwrap();
        assert!(!latest.from_cache);
        assert_eq!(latest.documents.len(), 1);
    }

    #[tokio::test]
    async fn successful_write_resolves_the_ack_receiver() {
        let (engine, datastore) = engine_with_datastore().await;
        let (_, receiver) = engine
            .write(vec![Mutation::set(key("cities/sf"), fields(1))])
            .await
            .unwrap();
        receiver.await.unwrap().unwrap();
        assert_eq!(datastore.commit_count().await, 1);
        assert!(!engine.local_store().has_pending_writes().await);
    }

    #[tokio::test]
    async fn writes_queue_while_offline_and_flush_on_enable() {
        let (engine, datastore) = engine_with_datastore().await;
        engine.disable_network().await.unwrap();
        engine
            .write(vec![Mutation::set(key("cities/sf"), fields(1))])
            .await
            .unwrap();
        settle().await;
        assert_eq!(datastore.commit_count().await, 0);

        engine.enable_network().await.unwrap();
        engine.wait_for_pending_writes().await.unwrap();
        assert_eq!(datastore.commit_count().await, 1);
    }

    #[tokio::test]
    async fn rejected_write_surfaces_the_error_and_reverts() {
        let (engine, datastore) = engine_with_datastore().await;
        datastore
            .enqueue_commit_response(Err(crate::error::permission_denied("nope")))
            .await;
        let (_, receiver) = engine
            .write(vec![Mutation::set(key("cities/sf"), fields(1))])
            .await
            .unwrap();
        let err = receiver.await.unwrap().unwrap_err();
        assert_eq!(err.code_str(), "firestore/permission-denied");
        assert!(!engine.local_store().has_pending_writes().await);
        let document = engine.read_document_from_cache(&key("cities/sf")).await.unwrap();
        assert!(!document.exists());
    }

    #[tokio::test]
    async fn wait_for_pending_writes_resolves_immediately_when_idle() {
        let (engine, _) = engine_with_datastore().await;
        engine.wait_for_pending_writes().await.unwrap();
    }

    #[tokio::test]
    async fn document_dropped_from_membership_enters_limbo() {
        let (engine, datastore) = engine_with_datastore().await;
        let (_, callback) = recording();
        engine
            .listen(cities(), SnapshotListenOptions::default(), callback)
            .await
            .unwrap();
        let target_id = datastore.listened_targets().await[0];

        engine
            .handle_watch_change(WatchChange::DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: vec![],
                document: Document::found(key("cities/sf"), Timestamp::new(5, 0), fields(1)),
            })
            .await
            .unwrap();
        engine
            .handle_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                    .with_read_time(Timestamp::new(5, 0)),
            ))
            .await
            .unwrap();
        assert_eq!(engine.limbo_document_count().await, 0);

        // The server silently drops the document from the target.
        engine
            .handle_watch_change(WatchChange::DocumentRemove {
                removed_target_ids: vec![target_id],
                key: key("cities/sf"),
            })
            .await
            .unwrap();
        engine
            .handle_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, vec![target_id])
                    .with_read_time(Timestamp::new(6, 0)),
            ))
            .await
            .unwrap();
        assert_eq!(engine.limbo_document_count().await, 1);

        // The limbo listen confirms the deletion.
        let limbo_target = *datastore
            .listened_targets()
            .await
            .iter()
            .find(|id| **id != target_id)
            .unwrap();
        engine
            .handle_watch_change(WatchChange::DocumentDelete {
                removed_target_ids: vec![limbo_target],
                key: key("cities/sf"),
                read_time: Some(Timestamp::new(7, 0)),
            })
            .await
            .unwrap();
        engine
            .handle_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, vec![limbo_target])
                    .with_read_time(Timestamp::new(7, 0)),
            ))
            .await
            .unwrap();
        assert_eq!(engine.limbo_document_count().await, 0);
        let document = engine.read_document_from_cache(&key("cities/sf")).await.unwrap();
        assert!(!document.exists());
    }
}
