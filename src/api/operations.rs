use std::collections::BTreeMap;
use std::sync::Arc;

use futures::channel::oneshot;
use tokio::task::JoinHandle;

use crate::api::database::FirestoreSettings;
use crate::api::reference::{CollectionReference, DocumentReference};
use crate::api::snapshot::{DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
use crate::core::{
    LimitType, ListenerRegistration, Query, SnapshotListenOptions, SyncEngine, ViewDocumentChange,
    ViewDocumentChangeType, ViewSnapshot,
};
use crate::error::{
    aborted, failed_precondition, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::local::{LeaseState, LocalStore, Persistence, PrimaryLeaseManager, DEFAULT_LEASE_DURATION};
use crate::model::{
    Document, DocumentKey, FieldPath, FieldTransform, Mutation, Precondition, Timestamp,
    TransformOperation,
};
use crate::remote::{Datastore, RemoteStore};
use crate::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Where a one-shot read is answered from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GetSource {
    /// Ask the backend, fall back to the cache when it is unreachable.
    #[default]
    Default,
    /// Backend only; unreachable backends surface as errors.
    Server,
    /// Cache only, never touches the network.
    Cache,
}

/// How `set_document` combines new data with an existing document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetOptions {
    merge: bool,
    merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    /// Replace the whole document.
    pub fn overwrite() -> Self {
        Self::default()
    }

    /// Merge every field present in the new data, leaving other fields
    /// untouched.
    pub fn merge() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    /// Merge only the named fields.
    pub fn merge_fields(paths: Vec<FieldPath>) -> Self {
        Self {
            merge: true,
            merge_fields: Some(paths),
        }
    }

    pub fn is_merge(&self) -> bool {
        self.merge
    }
}

/// Resolves once the backend acknowledges or rejects the write. Dropping
/// it does not cancel the write.
pub struct WriteAcknowledgment {
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl WriteAcknowledgment {
    pub async fn wait(self) -> FirestoreResult<()> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(aborted("client terminated before the write settled")),
        }
    }
}

/// Active snapshot listener. Call [`ListenerHandle::remove`] to stop it;
/// dropping the handle leaves the listener running.
pub struct ListenerHandle {
    engine: Arc<SyncEngine>,
    registration: Option<ListenerRegistration>,
}

impl ListenerHandle {
    pub async fn remove(mut self) -> FirestoreResult<()> {
        match self.registration.take() {
            Some(registration) => self.engine.unlisten(registration).await,
            None => Ok(()),
        }
    }
}

/// A started client: the sync engine plus its background tasks. Created
/// through the `start_*_persistence` functions on [`crate::api::Firestore`].
pub struct FirestoreClient {
    settings: FirestoreSettings,
    engine: Arc<SyncEngine>,
    datastore: Arc<dyn Datastore>,
    lease: Option<Arc<PrimaryLeaseManager>>,
    watch_pump: JoinHandle<()>,
    write_pipeline: JoinHandle<()>,
    lease_heartbeat: Option<JoinHandle<()>>,
}

impl FirestoreClient {
    pub(crate) async fn start(
        settings: FirestoreSettings,
        persistence: Arc<dyn Persistence>,
        datastore: Arc<dyn Datastore>,
        lease: Option<Arc<PrimaryLeaseManager>>,
    ) -> FirestoreResult<Self> {
        let local_store = Arc::new(LocalStore::load(persistence).await?);
        let remote_store = Arc::new(RemoteStore::new(datastore.clone()));
        let engine = Arc::new(SyncEngine::new(local_store, remote_store));
        let watch_pump = engine.spawn_watch_pump();
        let write_pipeline = engine.spawn_write_pipeline();

        let mut lease_heartbeat = None;
        if let Some(lease) = &lease {
            if lease.try_acquire().await? == LeaseState::Secondary {
                log::info!(
                    "client {} starting as secondary, network stays down until the lease is won",
                    lease.client_id()
                );
                engine.disable_network().await?;
            }
            lease_heartbeat = Some(spawn_lease_heartbeat(engine.clone(), lease.clone()));
        }

        // Batches persisted by a previous run are pushed as soon as the
        // client starts.
        engine.notify_write_pipeline();

        Ok(Self {
            settings,
            engine,
            datastore,
            lease,
            watch_pump,
            write_pipeline,
            lease_heartbeat,
        })
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        CollectionReference::new(path)
    }

    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        DocumentReference::new(path)
    }

    /// Reads one document. The default source answers from the cache when
    /// the document is known there and only then asks the backend;
    /// `Server` always asks the backend; `Cache` fails with `unavailable`
    /// when the cache knows nothing about the document.
    pub async fn get_document(
        &self,
        reference: &DocumentReference,
        source: GetSource,
    ) -> FirestoreResult<DocumentSnapshot> {
        match source {
            GetSource::Cache => {
                let (snapshot, known) = self.document_from_cache(reference).await?;
                if known {
                    Ok(snapshot)
                } else {
                    Err(unavailable(format!(
                        "Document {} is not cached",
                        reference.path()
                    )))
                }
            }
            GetSource::Server => self.document_from_server(reference).await,
            GetSource::Default => {
                let (snapshot, known) = self.document_from_cache(reference).await?;
                if known {
                    Ok(snapshot)
                } else {
                    self.document_from_server(reference).await
                }
            }
        }
    }

    /// Runs a query once and returns its current results. The default
    /// source serves non-empty cached results and otherwise asks the
    /// backend, keeping the empty cached result when the backend is
    /// unreachable.
    pub async fn get_documents(
        &self,
        query: &Query,
        source: GetSource,
    ) -> FirestoreResult<QuerySnapshot> {
        match source {
            GetSource::Cache => self.query_from_cache(query, true).await,
            GetSource::Server => self.query_from_server(query).await,
            GetSource::Default => {
                let cached = self.query_from_cache(query, true).await?;
                if !cached.is_empty() {
                    return Ok(cached);
                }
                match self.query_from_server(query).await {
                    Ok(snapshot) => Ok(snapshot),
                    Err(err) if err.code == FirestoreErrorCode::Unavailable => Ok(cached),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Creates a document with an auto-generated id under `collection`.
    pub async fn add_document(
        &self,
        collection: &CollectionReference,
        data: MapValue,
    ) -> FirestoreResult<(DocumentReference, WriteAcknowledgment)> {
        let reference = collection.doc_with_auto_id()?;
        let acknowledgment = self
            .set_document(&reference, data, SetOptions::overwrite())
            .await?;
        Ok((reference, acknowledgment))
    }

    /// Writes a document, replacing or merging per `options`. Resolves
    /// against the cache immediately; the acknowledgment settles when the
    /// backend commits.
    pub async fn set_document(
        &self,
        reference: &DocumentReference,
        data: MapValue,
        options: SetOptions,
    ) -> FirestoreResult<WriteAcknowledgment> {
        let (fields, transforms, leaf_paths) = split_sentinels(&data)?;
        let mask = if options.merge {
            Some(options.merge_fields.unwrap_or(leaf_paths))
        } else {
            None
        };
        let mutation = Mutation::Set {
            key: reference.key().clone(),
            data: fields,
            mask,
            transforms,
            precondition: Precondition::None,
        };
        self.enqueue(vec![mutation]).await
    }

    /// Patches individual fields of an existing document. Keys are
    /// dot-separated field paths; the document must exist.
    pub async fn update_document(
        &self,
        reference: &DocumentReference,
        fields: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<WriteAcknowledgment> {
        let mut data = BTreeMap::new();
        let mut field_paths = Vec::new();
        let mut transforms = Vec::new();
        for (dotted, value) in fields {
            let path = FieldPath::from_dot_separated(&dotted)?;
            match value.kind() {
                ValueKind::Sentinel(sentinel) => {
                    transforms.push(FieldTransform::new(path, transform_for(sentinel)));
                }
                _ => {
                    crate::value::set_field(&mut data, &path, value.clone());
                    field_paths.push(path);
                }
            }
        }
        let mutation = Mutation::patch(reference.key().clone(), MapValue::new(data), field_paths)
            .with_transforms(transforms);
        self.enqueue(vec![mutation]).await
    }

    pub async fn delete_document(
        &self,
        reference: &DocumentReference,
    ) -> FirestoreResult<WriteAcknowledgment> {
        self.enqueue(vec![Mutation::delete(reference.key().clone())])
            .await
    }

    /// Attaches a listener to a query. The first snapshot reflects the
    /// cache; later ones follow backend changes and local writes.
    pub async fn on_snapshot(
        &self,
        query: Query,
        options: SnapshotListenOptions,
        mut callback: impl FnMut(Result<QuerySnapshot, FirestoreError>) + Send + 'static,
    ) -> FirestoreResult<ListenerHandle> {
        let registration = self
            .engine
            .listen(
                query,
                options,
                Box::new(move |result| {
                    callback(result.map(QuerySnapshot::from_view_snapshot));
                }),
            )
            .await?;
        Ok(ListenerHandle {
            engine: self.engine.clone(),
            registration: Some(registration),
        })
    }

    /// Attaches a listener to a single document.
    pub async fn on_document_snapshot(
        &self,
        reference: &DocumentReference,
        options: SnapshotListenOptions,
        mut callback: impl FnMut(Result<DocumentSnapshot, FirestoreError>) + Send + 'static,
    ) -> FirestoreResult<ListenerHandle> {
        let key = reference.key().clone();
        let query = Query::document(key.clone());
        let registration = self
            .engine
            .listen(
                query,
                options,
                Box::new(move |result| {
                    callback(result.map(|snapshot| document_snapshot_from_view(&key, snapshot)));
                }),
            )
            .await?;
        Ok(ListenerHandle {
            engine: self.engine.clone(),
            registration: Some(registration),
        })
    }

    /// Fires after every batch of snapshot deliveries once all attached
    /// listeners are consistent with each other.
    pub async fn on_snapshots_in_sync(
        &self,
        callback: impl FnMut() + Send + 'static,
    ) -> ListenerHandle {
        let registration = self
            .engine
            .add_snapshots_in_sync_observer(Box::new(callback))
            .await;
        ListenerHandle {
            engine: self.engine.clone(),
            registration: Some(registration),
        }
    }

    /// Resolves once every write enqueued before this call has been
    /// acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.engine.wait_for_pending_writes().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.engine.enable_network().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.engine.disable_network().await
    }

    pub async fn is_network_enabled(&self) -> bool {
        self.engine.is_network_enabled().await
    }

    /// Whether this client currently owns the primary lease. Single-tab
    /// clients are always primary.
    pub async fn is_primary(&self) -> bool {
        match &self.lease {
            Some(lease) => lease.is_primary().await,
            None => true,
        }
    }

    /// Wipes the persisted cache, mutation queue and target registry.
    /// Refused while any listener is attached.
    pub async fn clear_persistence(&self) -> FirestoreResult<()> {
        if self.engine.has_active_listeners().await {
            return Err(failed_precondition(
                "persistence cannot be cleared while snapshot listeners are active",
            ));
        }
        self.engine.local_store().clear().await
    }

    /// Stops the background tasks and releases the primary lease. Pending
    /// write acknowledgments resolve as aborted.
    pub async fn terminate(self) -> FirestoreResult<()> {
        self.engine.disable_network().await?;
        self.watch_pump.abort();
        self.write_pipeline.abort();
        if let Some(heartbeat) = &self.lease_heartbeat {
            heartbeat.abort();
        }
        if let Some(lease) = &self.lease {
            lease.release().await?;
        }
        Ok(())
    }

    async fn enqueue(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteAcknowledgment> {
        let (_batch_id, receiver) = self.engine.write(mutations).await?;
        Ok(WriteAcknowledgment { receiver })
    }

    /// Cache read plus whether the cache actually knows the document: it
    /// exists, a queued mutation touches it, or its deletion was confirmed
    /// at a real version.
    async fn document_from_cache(
        &self,
        reference: &DocumentReference,
    ) -> FirestoreResult<(DocumentSnapshot, bool)> {
        let document = self
            .engine
            .read_document_from_cache(reference.key())
            .await?;
        let known = document.exists()
            || document.has_local_mutations()
            || document.version() > Timestamp::new(0, 0);
        let metadata = SnapshotMetadata {
            has_pending_writes: document.has_local_mutations(),
            from_cache: true,
        };
        Ok((DocumentSnapshot::new(document, metadata), known))
    }

    async fn document_from_server(
        &self,
        reference: &DocumentReference,
    ) -> FirestoreResult<DocumentSnapshot> {
        let document = self.datastore.lookup(reference.key()).await?;
        self.engine.apply_backend_read(vec![document]).await?;
        let document = self
            .engine
            .read_document_from_cache(reference.key())
            .await?;
        let metadata = SnapshotMetadata {
            has_pending_writes: document.has_local_mutations(),
            from_cache: false,
        };
        Ok(DocumentSnapshot::new(document, metadata))
    }

    async fn query_from_cache(
        &self,
        query: &Query,
        from_cache: bool,
    ) -> FirestoreResult<QuerySnapshot> {
        let result = self.engine.execute_query_from_cache(query).await?;
        let mut documents: Vec<Document> = result.documents.into_values().collect();
        documents.sort_by(|left, right| query.compare(left, right));
        if let Some(limit) = query.limit() {
            let limit = limit as usize;
            if documents.len() > limit {
                match query.limit_type() {
                    LimitType::First => documents.truncate(limit),
                    LimitType::Last => {
                        documents.drain(..documents.len() - limit);
                    }
                }
            }
        }
        let has_pending_writes = documents.iter().any(Document::has_local_mutations);
        let changes = documents
            .iter()
            .enumerate()
            .map(|(index, document)| ViewDocumentChange {
                kind: ViewDocumentChangeType::Added,
                document: document.clone(),
                old_index: None,
                new_index: Some(index),
            })
            .collect();
        Ok(QuerySnapshot::from_view_snapshot(ViewSnapshot {
            query: query.clone(),
            documents,
            changes,
            from_cache,
            has_pending_writes,
            sync_state_changed: false,
        }))
    }

    async fn query_from_server(&self, query: &Query) -> FirestoreResult<QuerySnapshot> {
        let documents = self.datastore.run_query(query).await?;
        self.engine.apply_backend_read(documents).await?;
        self.query_from_cache(query, false).await
    }
}

fn spawn_lease_heartbeat(
    engine: Arc<SyncEngine>,
    lease: Arc<PrimaryLeaseManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = DEFAULT_LEASE_DURATION / 2;
        loop {
            tokio::time::sleep(interval).await;
            let was_primary = lease.is_primary().await;
            let outcome = if was_primary {
                lease.refresh().await
            } else {
                lease.try_acquire().await
            };
            match outcome {
                Ok(LeaseState::Primary) if !was_primary => {
                    log::info!("client {} won the primary lease", lease.client_id());
                    if let Err(err) = engine.enable_network().await {
                        log::warn!("failed to enable network after lease win: {}", err);
                    }
                }
                Ok(LeaseState::Secondary) if was_primary => {
                    log::warn!("client {} lost the primary lease", lease.client_id());
                    if let Err(err) = engine.disable_network().await {
                        log::warn!("failed to disable network after lease loss: {}", err);
                    }
                }
                Ok(_) => {}
                Err(err) => log::warn!("primary lease heartbeat failed: {}", err),
            }
        }
    })
}

fn document_snapshot_from_view(key: &DocumentKey, snapshot: ViewSnapshot) -> DocumentSnapshot {
    let from_cache = snapshot.from_cache;
    match snapshot.documents.into_iter().next() {
        Some(document) => {
            let metadata = SnapshotMetadata {
                has_pending_writes: document.has_local_mutations(),
                from_cache,
            };
            DocumentSnapshot::new(document, metadata)
        }
        None => DocumentSnapshot::new(
            Document::missing(key.clone(), Timestamp::new(0, 0)),
            SnapshotMetadata {
                has_pending_writes: false,
                from_cache,
            },
        ),
    }
}

fn transform_for(sentinel: &SentinelValue) -> TransformOperation {
    match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => TransformOperation::ArrayUnion(elements.clone()),
        SentinelValue::ArrayRemove(elements) => TransformOperation::ArrayRemove(elements.clone()),
        SentinelValue::NumericIncrement(operand) => {
            TransformOperation::NumericIncrement((**operand).clone())
        }
    }
}

/// Splits sentinel values out of user data into field transforms, leaving
/// plain values in place. Returns the cleaned map, the transforms, and the
/// leaf field paths of the plain values (the merge mask).
fn split_sentinels(
    data: &MapValue,
) -> FirestoreResult<(MapValue, Vec<FieldTransform>, Vec<FieldPath>)> {
    let mut transforms = Vec::new();
    let mut leaf_paths = Vec::new();
    let mut prefix = Vec::new();
    let fields = strip_sentinels(data.fields(), &mut prefix, &mut transforms, &mut leaf_paths)?;
    Ok((MapValue::new(fields), transforms, leaf_paths))
}

fn strip_sentinels(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    transforms: &mut Vec<FieldTransform>,
    leaf_paths: &mut Vec<FieldPath>,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (name, value) in fields {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Sentinel(sentinel) => {
                let path = FieldPath::new(prefix.clone())?;
                transforms.push(FieldTransform::new(path, transform_for(sentinel)));
            }
            ValueKind::Map(map) => {
                let child = strip_sentinels(map.fields(), prefix, transforms, leaf_paths)?;
                cleaned.insert(name.clone(), FirestoreValue::from_map(child));
            }
            _ => {
                leaf_paths.push(FieldPath::new(prefix.clone())?);
                cleaned.insert(name.clone(), value.clone());
            }
        }
        prefix.pop();
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, FirestoreValue)>) -> MapValue {
        MapValue::new(
            entries
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    #[test]
    fn split_sentinels_extracts_transforms() {
        let data = map(vec![
            ("name", FirestoreValue::from_string("ada")),
            ("updated_at", FirestoreValue::server_timestamp()),
            (
                "stats",
                FirestoreValue::from_map(
                    map(vec![
                        (
                            "visits",
                            FirestoreValue::numeric_increment(FirestoreValue::from_integer(1)),
                        ),
                        ("label", FirestoreValue::from_string("x")),
                    ])
                    .into_fields(),
                ),
            ),
        ]);

        let (cleaned, transforms, leaf_paths) = split_sentinels(&data).unwrap();
        assert!(cleaned.fields().contains_key("name"));
        assert!(!cleaned.fields().contains_key("updated_at"));
        assert_eq!(transforms.len(), 2);
        let transform_fields: Vec<String> = transforms
            .iter()
            .map(|transform| transform.field().canonical_string())
            .collect();
        assert!(transform_fields.contains(&"updated_at".to_string()));
        assert!(transform_fields.contains(&"stats.visits".to_string()));
        assert_eq!(leaf_paths.len(), 2);
    }

    #[test]
    fn merge_options_carry_explicit_fields() {
        let options = SetOptions::merge_fields(vec![
            FieldPath::from_dot_separated("name").unwrap(),
        ]);
        assert!(options.is_merge());
    }
}
