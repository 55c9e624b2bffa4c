use crate::model::{DocumentKey, Timestamp};
use crate::value::MapValue;

/// Whether a document's contents are confirmed by the backend or reflect
/// locally applied, unacknowledged mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
}

/// The last-known state of a document, owned by the local document cache.
///
/// `fields == None` records a document that is known to be missing at
/// `version` — distinct from a key the cache has never heard about.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: Timestamp,
    fields: Option<MapValue>,
    state: DocumentState,
}

impl Document {
    pub fn found(key: DocumentKey, version: Timestamp, fields: MapValue) -> Self {
        Self {
            key,
            version,
            fields: Some(fields),
            state: DocumentState::Synced,
        }
    }

    pub fn missing(key: DocumentKey, version: Timestamp) -> Self {
        Self {
            key,
            version,
            fields: None,
            state: DocumentState::Synced,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> Timestamp {
        self.version
    }

    pub fn exists(&self) -> bool {
        self.fields.is_some()
    }

    pub fn fields(&self) -> Option<&MapValue> {
        self.fields.as_ref()
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    /// Replaces the contents with a locally computed overlay view.
    pub fn with_overlay(&self, fields: Option<MapValue>) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version,
            fields,
            state: DocumentState::HasLocalMutations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn records_existence() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let found = Document::found(
            key.clone(),
            Timestamp::new(1, 0),
            MapValue::new(BTreeMap::new()),
        );
        assert!(found.exists());
        assert!(!found.has_local_mutations());

        let missing = Document::missing(key, Timestamp::new(2, 0));
        assert!(!missing.exists());
    }

    #[test]
    fn overlay_marks_local_mutations() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let doc = Document::missing(key, Timestamp::new(1, 0));
        let overlaid = doc.with_overlay(Some(MapValue::new(BTreeMap::new())));
        assert!(overlaid.has_local_mutations());
        assert!(overlaid.exists());
    }
}
