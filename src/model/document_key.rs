use crate::error::{invalid_argument, FirestoreResult};
use crate::model::ResourcePath;

/// The path identifying a single document.
///
/// Document paths always have an even, non-zero number of segments
/// (collection/id pairs all the way down).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() < 2 || path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "Invalid document path '{}': documents must have an even number of segments",
                path.canonical_string()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path
            .last_segment()
            .expect("document keys are never empty")
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the immediately enclosing collection.
    pub fn collection_id(&self) -> &str {
        self.path
            .segment(self.path.len() - 2)
            .expect("document keys always have a parent collection")
    }

    pub fn canonical_string(&self) -> String {
        self.path.canonical_string()
    }
}
