use crate::error::{invalid_argument, FirestoreResult};

pub const DOCUMENT_ID_SENTINEL: &str = "__name__";

/// A dot-separated path to a field within a document.
///
/// Always contains at least one non-empty segment; two paths are equal iff
/// their segment sequences are equal element-wise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument(
                "FieldPath must contain at least one segment",
            ));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument(
                "FieldPath segments cannot be empty strings",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        Self::new(path.split('.'))
    }

    /// The sentinel path referring to the document's key in queries.
    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_ID_SENTINEL.to_string()],
        }
    }

    pub fn is_document_id(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_ID_SENTINEL
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last_segment(&self) -> &str {
        self.segments
            .last()
            .expect("FieldPath always has at least one segment")
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}
