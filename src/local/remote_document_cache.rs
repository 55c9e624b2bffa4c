use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::codec;
use crate::local::persistence::{namespaces, Persistence, PersistenceOp};
use crate::model::{Document, DocumentKey};

/// Cache of the latest server-confirmed state of documents, keyed by the
/// document's canonical path. Remote updates only land here when their
/// version is at least as new as the cached one.
pub struct RemoteDocumentCache {
    persistence: Arc<dyn Persistence>,
}

impl RemoteDocumentCache {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    pub async fn get(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        match self
            .persistence
            .get(namespaces::DOCUMENTS, &key.canonical_string())
            .await?
        {
            Some(raw) => Ok(Some(codec::decode_document(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all(
        &self,
        keys: &[DocumentKey],
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut documents = BTreeMap::new();
        for key in keys {
            if let Some(document) = self.get(key).await? {
                documents.insert(key.clone(), document);
            }
        }
        Ok(documents)
    }

    /// Writes the document unconditionally. Used when the caller has already
    /// decided the update wins, e.g. when acknowledging a mutation batch.
    pub async fn set(&self, document: &Document) -> FirestoreResult<()> {
        self.persistence
            .put(
                namespaces::DOCUMENTS,
                &document.key().canonical_string(),
                &codec::encode_document(document)?,
            )
            .await
    }

    /// Applies a server update, keeping whichever version is newer. Returns
    /// true when the cache changed; stale updates are dropped silently.
    pub async fn apply_remote_document(&self, document: &Document) -> FirestoreResult<bool> {
        if let Some(existing) = self.get(document.key()).await? {
            if existing.version() > document.version() {
                return Ok(false);
            }
            if existing == *document {
                return Ok(false);
            }
        }
        self.set(document).await?;
        Ok(true)
    }

    pub async fn remove(&self, key: &DocumentKey) -> FirestoreResult<()> {
        self.persistence
            .delete(namespaces::DOCUMENTS, &key.canonical_string())
            .await
    }

    /// Full scan filtered down to documents that could match the query's
    /// path. Filters and bounds are evaluated by the view layer on top of
    /// this candidate set.
    pub async fn documents_matching_query(
        &self,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut documents = BTreeMap::new();
        for raw_key in self.persistence.keys(namespaces::DOCUMENTS).await? {
            let key = DocumentKey::from_string(&raw_key)?;
            if !query.matches_key(&key) {
                continue;
            }
            if let Some(document) = self.get(&key).await? {
                documents.insert(key, document);
            }
        }
        Ok(documents)
    }

    pub fn put_op(document: &Document) -> FirestoreResult<PersistenceOp> {
        Ok(PersistenceOp::Put {
            namespace: namespaces::DOCUMENTS,
            key: document.key().canonical_string(),
            value: codec::encode_document(document)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryPersistence;
    use crate::model::Timestamp;
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap as Map;

    fn doc(path: &str, seconds: i64, name: &str) -> Document {
        let mut fields = Map::new();
        fields.insert("name".to_string(), FirestoreValue::from_string(name));
        Document::found(
            DocumentKey::from_string(path).unwrap(),
            Timestamp::new(seconds, 0),
            MapValue::new(fields),
        )
    }

    fn cache() -> RemoteDocumentCache {
        RemoteDocumentCache::new(Arc::new(MemoryPersistence::new()))
    }

    #[tokio::test]
    async fn newer_version_replaces_older() {
        let cache = cache();
        assert!(cache.apply_remote_document(&doc("cities/sf", 1, "a")).await.unwrap());
        assert!(cache.apply_remote_document(&doc("cities/sf", 2, "b")).await.unwrap());
        let stored = cache
            .get(&DocumentKey::from_string("cities/sf").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version(), Timestamp::new(2, 0));
    }

    #[tokio::test]
    async fn stale_version_is_dropped() {
        let cache = cache();
        cache.apply_remote_document(&doc("cities/sf", 5, "a")).await.unwrap();
        assert!(!cache.apply_remote_document(&doc("cities/sf", 3, "b")).await.unwrap());
        let stored = cache
            .get(&DocumentKey::from_string("cities/sf").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version(), Timestamp::new(5, 0));
    }

    #[tokio::test]
    async fn query_scan_is_limited_to_the_collection() {
        let cache = cache();
        cache.set(&doc("cities/sf", 1, "sf")).await.unwrap();
        cache.set(&doc("cities/la", 1, "la")).await.unwrap();
        cache.set(&doc("users/ada", 1, "ada")).await.unwrap();
        cache
            .set(&doc("cities/sf/districts/soma", 1, "soma"))
            .await
            .unwrap();

        let query =
            Query::collection(crate::model::ResourcePath::from_string("cities").unwrap()).unwrap();
        let matches = cache.documents_matching_query(&query).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.contains_key(&DocumentKey::from_string("cities/sf").unwrap()));
        assert!(matches.contains_key(&DocumentKey::from_string("cities/la").unwrap()));
    }
}
