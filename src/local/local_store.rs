use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::core::{Query, TargetData};
use crate::error::FirestoreResult;
use crate::local::mutation_queue::MutationQueue;
use crate::local::persistence::{Persistence, PersistenceKind};
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::{TargetCache, TargetMetadata};
use crate::model::{
    apply_mutations_to_local_view, Document, DocumentKey, Mutation, MutationBatch,
    MutationBatchResult, Timestamp,
};
use crate::remote::RemoteEvent;

/// Documents produced by a query against local state, with any pending
/// mutations already applied.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
}

/// Facade over everything persisted on this client: the remote document
/// cache, the mutation queue, and the target cache. All reads go through
/// here so callers always see the latency-compensated view, i.e. cached
/// server state with pending local mutations replayed on top.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    target_cache: TargetCache,
}

impl LocalStore {
    pub async fn load(persistence: Arc<dyn Persistence>) -> FirestoreResult<Self> {
        let remote_documents = RemoteDocumentCache::new(persistence.clone());
        let mutation_queue = MutationQueue::load(persistence.clone()).await?;
        let target_cache = TargetCache::load(persistence.clone()).await?;
        Ok(Self {
            persistence,
            remote_documents,
            mutation_queue,
            target_cache,
        })
    }

    pub fn persistence_kind(&self) -> PersistenceKind {
        self.persistence.kind()
    }

    /// The latency-compensated view of one document. Always yields a
    /// document; a key with no cached state and no mutations comes back as
    /// a missing document at version zero.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let base = self.remote_documents.get(key).await?;
        let mutations = self.mutation_queue.mutations_for_key(key).await;
        if mutations.is_empty() {
            return Ok(base
                .unwrap_or_else(|| Document::missing(key.clone(), Timestamp::default())));
        }
        let overlay = apply_mutations_to_local_view(base.as_ref(), &mutations)?;
        let template =
            base.unwrap_or_else(|| Document::missing(key.clone(), Timestamp::default()));
        Ok(template.with_overlay(overlay))
    }

    /// Runs a query against local state. Candidates come from the remote
    /// document cache plus any documents only created by pending mutations.
    pub async fn execute_query(&self, query: &Query) -> FirestoreResult<QueryResult> {
        let mut candidates = self.remote_documents.documents_matching_query(query).await?;
        for key in self.mutation_queue.all_affected_keys().await {
            if query.matches_key(&key) && !candidates.contains_key(&key) {
                candidates.insert(key.clone(), Document::missing(key, Timestamp::default()));
            }
        }

        let mut documents = BTreeMap::new();
        for key in candidates.keys().cloned().collect::<Vec<_>>() {
            let document = self.read_document(&key).await?;
            if query.matches(&document) {
                documents.insert(key, document);
            }
        }
        Ok(QueryResult { documents })
    }

    /// Stages mutations locally. Returns the new batch together with the
    /// updated view of every affected document so views can re-render
    /// before the server is involved.
    pub async fn write_locally(
        &self,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<(MutationBatch, BTreeMap<DocumentKey, Document>)> {
        let batch = self
            .mutation_queue
            .enqueue(mutations, Timestamp::now())
            .await?;
        let changed = self.read_documents(&batch.document_keys()).await?;
        debug!("batch {} staged, {} document(s) affected", batch.batch_id, changed.len());
        Ok((batch, changed))
    }

    /// Applies a server acknowledgement: the confirmed state lands in the
    /// remote document cache and the batch leaves the queue. Returns the
    /// re-read views of the affected documents.
    pub async fn acknowledge_batch(
        &self,
        result: &MutationBatchResult,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let Some(batch) = self.mutation_queue.acknowledge(result.batch_id).await? else {
            return Ok(BTreeMap::new());
        };
        for (index, mutation) in batch.mutations.iter().enumerate() {
            let version = result
                .mutation_results
                .get(index)
                .and_then(|mutation_result| mutation_result.version)
                .unwrap_or(result.commit_version);
            let base = self.remote_documents.get(mutation.key()).await?;
            let fields = mutation
                .apply_to_local_view(base.as_ref().and_then(Document::fields), batch.local_write_time)?;
            let confirmed = match fields {
                Some(fields) => Document::found(mutation.key().clone(), version, fields),
                None => Document::missing(mutation.key().clone(), version),
            };
            self.remote_documents.apply_remote_document(&confirmed).await?;
        }
        self.read_documents(&batch.document_keys()).await
    }

    /// Drops a batch the server refused. The affected documents are re-read
    /// so views snap back to the state without the failed writes.
    pub async fn reject_batch(
        &self,
        batch_id: i32,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let Some(batch) = self.mutation_queue.reject(batch_id).await? else {
            return Ok(BTreeMap::new());
        };
        self.read_documents(&batch.document_keys()).await
    }

    /// Folds a consistent remote event into persisted state: target
    /// metadata first, then document updates with newer-version-wins.
    /// Returns the updated views of every document that actually changed.
    pub async fn apply_remote_event(
        &self,
        event: &RemoteEvent,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        for (target_id, change) in &event.target_changes {
            let Some(mut metadata) = self.target_cache.get(*target_id).await else {
                continue;
            };
            if !change.resume_token.is_empty() {
                metadata.resume_token = change.resume_token.clone();
            }
            metadata.snapshot_version = event.snapshot_version;
            metadata.current = change.current;
            self.target_cache.update(metadata).await?;
            let added: Vec<DocumentKey> = change
                .added_documents
                .iter()
                .chain(change.modified_documents.iter())
                .cloned()
                .collect();
            let removed: Vec<DocumentKey> = change.removed_documents.iter().cloned().collect();
            self.target_cache
                .update_remote_keys(*target_id, &added, &removed)
                .await?;
        }

        for target_id in &event.target_resets {
            if let Some(mut metadata) = self.target_cache.get(*target_id).await {
                metadata.resume_token = Vec::new();
                metadata.current = false;
                metadata.remote_keys.clear();
                self.target_cache.update(metadata).await?;
            }
        }

        let mut changed_keys = Vec::new();
        for document in event.document_updates.values() {
            if self.remote_documents.apply_remote_document(document).await? {
                changed_keys.push(document.key().clone());
            }
        }
        self.read_documents(&changed_keys).await
    }

    async fn read_documents(
        &self,
        keys: &[DocumentKey],
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), self.read_document(key).await?);
        }
        Ok(documents)
    }

    /// Registers a watch target for the query, reusing the persisted target
    /// (and its resume token) when an equivalent query was listened before.
    pub async fn allocate_target(&self, query: &Query) -> FirestoreResult<TargetData> {
        let metadata = self.target_cache.allocate(&query.canonical_id()).await?;
        let resume_token = if metadata.resume_token.is_empty() {
            None
        } else {
            Some(metadata.resume_token.clone())
        };
        let snapshot_version = if metadata.snapshot_version == Timestamp::default() {
            None
        } else {
            Some(metadata.snapshot_version)
        };
        Ok(TargetData::new(metadata.target_id, query.clone())
            .with_resume_token(resume_token)
            .with_snapshot_version(snapshot_version))
    }

    pub async fn release_target(&self, target_id: i32) -> FirestoreResult<()> {
        self.target_cache.remove(target_id).await
    }

    pub async fn target_metadata(&self, target_id: i32) -> Option<TargetMetadata> {
        self.target_cache.get(target_id).await
    }

    pub async fn has_pending_writes(&self) -> bool {
        !self.mutation_queue.is_empty().await
    }

    pub async fn highest_pending_batch_id(&self) -> Option<i32> {
        self.mutation_queue.highest_batch_id().await
    }

    /// See [`MutationQueue::drain_signal`].
    pub async fn pending_writes_signal(
        &self,
    ) -> Option<futures::channel::oneshot::Receiver<()>> {
        self.mutation_queue.drain_signal().await
    }

    pub async fn next_batch_after(&self, batch_id: i32) -> Option<MutationBatch> {
        self.mutation_queue.next_batch_after(batch_id).await
    }

    /// Wipes every namespace of the backing persistence.
    pub async fn clear(&self) -> FirestoreResult<()> {
        self.persistence.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldFilter, FilterOperator};
    use crate::local::MemoryPersistence;
    use crate::model::{FieldPath, MutationResult, ResourcePath};
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap as Map;

    async fn store() -> LocalStore {
        LocalStore::load(Arc::new(MemoryPersistence::new())).await.unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn fields(name: &str, population: i64) -> MapValue {
        let mut map = Map::new();
        map.insert("name".to_string(), FirestoreValue::from_string(name));
        map.insert(
            "population".to_string(),
            FirestoreValue::from_integer(population),
        );
        MapValue::new(map)
    }

    fn cities_query() -> Query {
        Query::collection(ResourcePath::from_string("cities").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn pending_set_is_visible_before_any_server_state() {
        let store = store().await;
        store
            .write_locally(vec![Mutation::set(key("cities/sf"), fields("SF", 100))])
            .await
            .unwrap();

        let document = store.read_document(&key("cities/sf")).await.unwrap();
        assert!(document.exists());
        assert!(document.has_local_mutations());
    }

    #[tokio::test]
    async fn acknowledged_write_becomes_synced() {
        let store = store().await;
        let (batch, _) = store
            .write_locally(vec![Mutation::set(key("cities/sf"), fields("SF", 100))])
            .await
            .unwrap();

        let result = MutationBatchResult::new(
            batch.batch_id,
            Timestamp::new(10, 0),
            vec![MutationResult {
                version: Some(Timestamp::new(10, 0)),
                transform_results: Vec::new(),
            }],
        );
        let changed = store.acknowledge_batch(&result).await.unwrap();
        let document = &changed[&key("cities/sf")];
        assert!(document.exists());
        assert!(!document.has_local_mutations());
        assert_eq!(document.version(), Timestamp::new(10, 0));
    }

    #[tokio::test]
    async fn rejected_write_reverts_to_server_state() {
        let store = store().await;
        let server = Document::found(key("cities/sf"), Timestamp::new(1, 0), fields("SF", 50));
        store.remote_documents.apply_remote_document(&server).await.unwrap();

        let (batch, _) = store
            .write_locally(vec![Mutation::set(key("cities/sf"), fields("SF", 999))])
            .await
            .unwrap();
        let changed = store.reject_batch(batch.batch_id).await.unwrap();
        let document = &changed[&key("cities/sf")];
        assert!(!document.has_local_mutations());
        assert_eq!(document.fields(), server.fields());
    }

    #[tokio::test]
    async fn query_sees_documents_created_only_by_mutations() {
        let store = store().await;
        let server = Document::found(key("cities/la"), Timestamp::new(1, 0), fields("LA", 300));
        store.remote_documents.apply_remote_document(&server).await.unwrap();
        store
            .write_locally(vec![Mutation::set(key("cities/sf"), fields("SF", 100))])
            .await
            .unwrap();

        let result = store.execute_query(&cities_query()).await.unwrap();
        assert_eq!(result.documents.len(), 2);
        assert!(result.documents[&key("cities/sf")].has_local_mutations());
        assert!(!result.documents[&key("cities/la")].has_local_mutations());
    }

    #[tokio::test]
    async fn query_filters_apply_to_the_overlay_view() {
        let store = store().await;
        let server = Document::found(key("cities/sf"), Timestamp::new(1, 0), fields("SF", 50));
        store.remote_documents.apply_remote_document(&server).await.unwrap();
        store
            .write_locally(vec![Mutation::patch(
                key("cities/sf"),
                fields("SF", 500),
                vec![FieldPath::from_dot_separated("population").unwrap()],
            )])
            .await
            .unwrap();

        let query = cities_query().with_filter(FieldFilter::new(
            FieldPath::from_dot_separated("population").unwrap(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_integer(100),
        ));
        let result = store.execute_query(&query).await.unwrap();
        assert_eq!(result.documents.len(), 1);
    }

    #[tokio::test]
    async fn remote_event_updates_documents_and_target_metadata() {
        let store = store().await;
        let target = store.allocate_target(&cities_query()).await.unwrap();

        let mut event = RemoteEvent {
            snapshot_version: Timestamp::new(9, 0),
            ..RemoteEvent::default()
        };
        let mut change = crate::remote::TargetChange {
            resume_token: vec![1, 2],
            current: true,
            ..crate::remote::TargetChange::default()
        };
        change.added_documents.insert(key("cities/sf"));
        event.target_changes.insert(target.target_id(), change);
        event.document_updates.insert(
            key("cities/sf"),
            Document::found(key("cities/sf"), Timestamp::new(9, 0), fields("SF", 100)),
        );

        let changed = store.apply_remote_event(&event).await.unwrap();
        assert!(changed[&key("cities/sf")].exists());

        let metadata = store.target_metadata(target.target_id()).await.unwrap();
        assert_eq!(metadata.resume_token, vec![1, 2]);
        assert!(metadata.current);
        assert!(metadata.remote_keys.contains(&key("cities/sf")));
    }

    #[tokio::test]
    async fn target_reset_clears_membership_and_resume_token() {
        let store = store().await;
        let target = store.allocate_target(&cities_query()).await.unwrap();
        let mut metadata = store.target_metadata(target.target_id()).await.unwrap();
        metadata.resume_token = vec![5];
        metadata.current = true;
        metadata.remote_keys.insert(key("cities/sf"));
        store.target_cache.update(metadata).await.unwrap();

        let mut event = RemoteEvent::default();
        event.target_resets.insert(target.target_id());
        store.apply_remote_event(&event).await.unwrap();

        let metadata = store.target_metadata(target.target_id()).await.unwrap();
        assert!(metadata.resume_token.is_empty());
        assert!(!metadata.current);
        assert!(metadata.remote_keys.is_empty());
    }

    #[tokio::test]
    async fn reallocating_an_equal_query_restores_the_resume_token() {
        let store = store().await;
        let target = store.allocate_target(&cities_query()).await.unwrap();
        let mut metadata = store.target_metadata(target.target_id()).await.unwrap();
        metadata.resume_token = vec![7];
        metadata.snapshot_version = Timestamp::new(4, 0);
        store.target_cache.update(metadata).await.unwrap();

        let again = store.allocate_target(&cities_query()).await.unwrap();
        assert_eq!(again.target_id(), target.target_id());
        assert_eq!(again.resume_token(), Some(&[7u8][..]));
        assert_eq!(again.snapshot_version(), Some(Timestamp::new(4, 0)));
    }
}
