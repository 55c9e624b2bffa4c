mod document;
mod document_key;
mod field_path;
mod geo_point;
mod mutation;
mod resource_path;
mod timestamp;

pub use document::{Document, DocumentState};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    apply_mutations_to_local_view, FieldTransform, Mutation, MutationBatch, MutationBatchResult,
    MutationResult, Precondition, TransformOperation,
};
pub use resource_path::ResourcePath;
pub use timestamp::Timestamp;
