use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::core::Query;
use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{DocumentKey, ResourcePath};

const AUTO_ID_LENGTH: usize = 20;

fn auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(AUTO_ID_LENGTH)
        .collect()
}

/// A location of a single document, whether or not it exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentReference {
    key: DocumentKey,
}

impl DocumentReference {
    pub fn new(path: &str) -> FirestoreResult<Self> {
        Ok(Self {
            key: DocumentKey::from_string(path)?,
        })
    }

    pub(crate) fn from_key(key: DocumentKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The final path segment.
    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn path(&self) -> String {
        self.key.canonical_string()
    }

    pub fn parent(&self) -> CollectionReference {
        CollectionReference {
            path: self.key.collection_path(),
        }
    }

    /// A subcollection of this document.
    pub fn collection(&self, collection_id: &str) -> FirestoreResult<CollectionReference> {
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(
                "Collection ids must be non-empty and cannot contain '/'",
            ));
        }
        Ok(CollectionReference {
            path: self.key.path().child(collection_id),
        })
    }

    /// The single-document query backing document listens.
    pub fn as_query(&self) -> Query {
        Query::document(self.key.clone())
    }
}

/// A location of a collection of documents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionReference {
    path: ResourcePath,
}

impl CollectionReference {
    pub fn new(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.is_empty() || path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection path '{}': collections have an odd number of segments",
                path.canonical_string()
            )));
        }
        Ok(Self { path })
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn path(&self) -> String {
        self.path.canonical_string()
    }

    pub fn parent(&self) -> Option<DocumentReference> {
        if self.path.len() < 2 {
            return None;
        }
        DocumentKey::from_path(self.path.without_last())
            .ok()
            .map(DocumentReference::from_key)
    }

    pub fn doc(&self, document_id: &str) -> FirestoreResult<DocumentReference> {
        if document_id.is_empty() || document_id.contains('/') {
            return Err(invalid_argument(
                "Document ids must be non-empty and cannot contain '/'",
            ));
        }
        Ok(DocumentReference::from_key(DocumentKey::from_path(
            self.path.child(document_id),
        )?))
    }

    /// A reference with a freshly generated 20-character id.
    pub fn doc_with_auto_id(&self) -> FirestoreResult<DocumentReference> {
        self.doc(&auto_id())
    }

    pub fn query(&self) -> FirestoreResult<Query> {
        Query::collection(self.path.clone())
    }
}

/// Structural equality of two references of the same kind.
pub fn references_equal(left: &DocumentReference, right: &DocumentReference) -> bool {
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_and_child_round_trip() {
        let cities = CollectionReference::new("cities").unwrap();
        let sf = cities.doc("sf").unwrap();
        assert_eq!(sf.path(), "cities/sf");
        assert_eq!(sf.id(), "sf");
        assert_eq!(sf.parent(), cities);
        assert!(cities.parent().is_none());

        let districts = sf.collection("districts").unwrap();
        assert_eq!(districts.path(), "cities/sf/districts");
        assert_eq!(districts.parent().unwrap(), sf);
    }

    #[test]
    fn document_paths_must_have_even_segments() {
        assert!(DocumentReference::new("cities").is_err());
        assert!(DocumentReference::new("cities/sf").is_ok());
        assert!(CollectionReference::new("cities/sf").is_err());
    }

    #[test]
    fn auto_ids_are_twenty_chars_and_distinct() {
        let cities = CollectionReference::new("cities").unwrap();
        let a = cities.doc_with_auto_id().unwrap();
        let b = cities.doc_with_auto_id().unwrap();
        assert_eq!(a.id().len(), 20);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn equality_is_structural() {
        let a = DocumentReference::new("cities/sf").unwrap();
        let b = DocumentReference::new("cities/sf").unwrap();
        let c = DocumentReference::new("cities/la").unwrap();
        assert!(references_equal(&a, &b));
        assert!(!references_equal(&a, &c));
    }
}
