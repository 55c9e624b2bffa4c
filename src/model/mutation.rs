use std::collections::BTreeMap;

use crate::error::{failed_precondition, invalid_argument, FirestoreResult};
use crate::model::{Document, DocumentKey, FieldPath, Timestamp};
use crate::value::{remove_field, resolve_field, set_field, FirestoreValue, MapValue, ValueKind};

/// Server-side state a mutation requires before it may be applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    pub fn is_validated_by(&self, base: Option<&Document>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(expected) => {
                let exists = base.map(Document::exists).unwrap_or(false);
                exists == *expected
            }
            Precondition::UpdateTime(version) => base
                .map(|doc| doc.exists() && doc.version() == *version)
                .unwrap_or(false),
        }
    }
}

/// A transform applied to a single field as part of a write.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// A single write against one document path.
///
/// Mutations are totally ordered by enqueue time; within the local overlay a
/// later mutation wins per-field.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        data: MapValue,
        /// When present the write behaves like a merge: only masked fields
        /// are copied onto the existing document.
        mask: Option<Vec<FieldPath>>,
        transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_paths: Vec<FieldPath>,
        transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, data: MapValue) -> Self {
        Mutation::Set {
            key,
            data,
            mask: None,
            transforms: Vec::new(),
            precondition: Precondition::None,
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, field_paths: Vec<FieldPath>) -> Self {
        Mutation::Patch {
            key,
            data,
            field_paths,
            transforms: Vec::new(),
            // Updates require the document to exist, matching backend
            // semantics for patch writes.
            precondition: Precondition::Exists(true),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn with_transforms(self, transforms: Vec<FieldTransform>) -> Self {
        match self {
            Mutation::Set {
                key,
                data,
                mask,
                precondition,
                ..
            } => Mutation::Set {
                key,
                data,
                mask,
                transforms,
                precondition,
            },
            Mutation::Patch {
                key,
                data,
                field_paths,
                precondition,
                ..
            } => Mutation::Patch {
                key,
                data,
                field_paths,
                transforms,
                precondition,
            },
            delete @ Mutation::Delete { .. } => delete,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. } => precondition,
        }
    }

    /// Applies this mutation on top of `base` without consulting the backend,
    /// producing the latency-compensated field state (`None` = deleted).
    pub fn apply_to_local_view(
        &self,
        base: Option<&MapValue>,
        local_write_time: Timestamp,
    ) -> FirestoreResult<Option<MapValue>> {
        match self {
            Mutation::Set {
                data,
                mask,
                transforms,
                ..
            } => {
                let mut fields = match mask {
                    Some(mask) => {
                        let mut fields =
                            base.map(|map| map.fields().clone()).unwrap_or_default();
                        for path in mask {
                            match resolve_field(data, path) {
                                Some(value) => set_field(&mut fields, path, value.clone()),
                                None => remove_field(&mut fields, path),
                            }
                        }
                        fields
                    }
                    None => data.fields().clone(),
                };
                apply_transforms(&mut fields, transforms, local_write_time)?;
                Ok(Some(MapValue::new(fields)))
            }
            Mutation::Patch {
                data,
                field_paths,
                transforms,
                ..
            } => {
                let mut fields = base.map(|map| map.fields().clone()).unwrap_or_default();
                for path in field_paths {
                    let value = resolve_field(data, path).ok_or_else(|| {
                        invalid_argument(format!(
                            "No value supplied for update path {}",
                            path.canonical_string()
                        ))
                    })?;
                    set_field(&mut fields, path, value.clone());
                }
                apply_transforms(&mut fields, transforms, local_write_time)?;
                Ok(Some(MapValue::new(fields)))
            }
            Mutation::Delete { .. } => Ok(None),
        }
    }
}

/// Replays `mutations` in order atop `base`, skipping mutations whose
/// precondition fails against the evolving state.
pub fn apply_mutations_to_local_view(
    base_document: Option<&Document>,
    mutations: &[(Mutation, Timestamp)],
) -> FirestoreResult<Option<MapValue>> {
    let mut exists = base_document.map(Document::exists).unwrap_or(false);
    let mut current = base_document.and_then(|doc| doc.fields().cloned());

    for (mutation, write_time) in mutations {
        let satisfied = match mutation.precondition() {
            Precondition::None => true,
            Precondition::Exists(expected) => exists == *expected,
            Precondition::UpdateTime(version) => base_document
                .map(|doc| doc.exists() && doc.version() == *version)
                .unwrap_or(false),
        };
        if !satisfied {
            continue;
        }
        current = mutation.apply_to_local_view(current.as_ref(), *write_time)?;
        exists = current.is_some();
    }
    Ok(current)
}

fn apply_transforms(
    fields: &mut BTreeMap<String, FirestoreValue>,
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
) -> FirestoreResult<()> {
    if transforms.is_empty() {
        return Ok(());
    }

    let snapshot = MapValue::new(fields.clone());
    for transform in transforms {
        let current = resolve_field(&snapshot, transform.field()).cloned();
        let next = match transform.operation() {
            TransformOperation::ServerTimestamp => {
                // Locally the commit time is estimated by the write time; the
                // authoritative value arrives with the acknowledgment.
                FirestoreValue::from_timestamp(local_write_time)
            }
            TransformOperation::ArrayUnion(elements) => array_union(current, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(current, elements),
            TransformOperation::NumericIncrement(operand) => {
                numeric_increment(current, operand)?
            }
        };
        set_field(fields, transform.field(), next);
    }
    Ok(())
}

fn array_union(existing: Option<FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_array(existing);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_array(existing)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(values)
}

fn existing_array(existing: Option<FirestoreValue>) -> Vec<FirestoreValue> {
    match existing {
        Some(value) => match value.kind() {
            ValueKind::Array(array) => array.values().to_vec(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn numeric_increment(
    existing: Option<FirestoreValue>,
    operand: &FirestoreValue,
) -> FirestoreResult<FirestoreValue> {
    let result = match (existing, operand.kind()) {
        (Some(value), ValueKind::Integer(delta)) => match value.kind() {
            ValueKind::Integer(current) => match current.checked_add(*delta) {
                Some(sum) => FirestoreValue::from_integer(sum),
                None => FirestoreValue::from_double(*current as f64 + *delta as f64),
            },
            ValueKind::Double(current) => FirestoreValue::from_double(*current + *delta as f64),
            _ => FirestoreValue::from_integer(*delta),
        },
        (Some(value), ValueKind::Double(delta)) => match value.kind() {
            ValueKind::Integer(current) => FirestoreValue::from_double(*current as f64 + *delta),
            ValueKind::Double(current) => FirestoreValue::from_double(*current + *delta),
            _ => FirestoreValue::from_double(*delta),
        },
        (None, ValueKind::Integer(delta)) => FirestoreValue::from_integer(*delta),
        (None, ValueKind::Double(delta)) => FirestoreValue::from_double(*delta),
        _ => {
            return Err(invalid_argument(
                "increment() requires a numeric operand",
            ))
        }
    };
    Ok(result)
}

/// An ordered group of mutations enqueued together.
#[derive(Clone, Debug)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: i32, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn document_keys(&self) -> Vec<DocumentKey> {
        let mut keys: Vec<DocumentKey> = self
            .mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Checks every precondition in the batch against the current cache state
    /// of the targeted documents.
    pub fn check_preconditions<'a>(
        &self,
        lookup: impl Fn(&DocumentKey) -> Option<&'a Document>,
    ) -> FirestoreResult<()> {
        for mutation in &self.mutations {
            if !mutation.precondition().is_validated_by(lookup(mutation.key())) {
                return Err(failed_precondition(format!(
                    "Precondition failed for document {}",
                    mutation.key().canonical_string()
                )));
            }
        }
        Ok(())
    }
}

/// Per-mutation acknowledgment payload from the backend.
#[derive(Clone, Debug, Default)]
pub struct MutationResult {
    pub version: Option<Timestamp>,
    pub transform_results: Vec<FirestoreValue>,
}

/// Acknowledgment of a whole batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch_id: i32,
    pub commit_version: Timestamp,
    pub mutation_results: Vec<MutationResult>,
}

impl MutationBatchResult {
    pub fn new(
        batch_id: i32,
        commit_version: Timestamp,
        mutation_results: Vec<MutationResult>,
    ) -> Self {
        Self {
            batch_id,
            commit_version,
            mutation_results,
        }
    }
}
