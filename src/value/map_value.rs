use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{FirestoreValue, ValueKind};

/// An ordered field-name to value mapping, the top-level shape of every
/// document and the payload of nested map values.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        resolve_field(self, path)
    }
}

/// Resolves a (possibly nested) field path against a map value.
pub fn resolve_field<'a>(map: &'a MapValue, path: &FieldPath) -> Option<&'a FirestoreValue> {
    resolve_segments(map, path.segments())
}

fn resolve_segments<'a>(map: &'a MapValue, segments: &[String]) -> Option<&'a FirestoreValue> {
    let (first, rest) = segments.split_first()?;
    let value = map.fields.get(first)?;
    if rest.is_empty() {
        Some(value)
    } else if let ValueKind::Map(child) = value.kind() {
        resolve_segments(child, rest)
    } else {
        None
    }
}

/// Writes `value` at `path`, materializing intermediate maps. A non-map value
/// found along the way is replaced by a map.
pub fn set_field(fields: &mut BTreeMap<String, FirestoreValue>, path: &FieldPath, value: FirestoreValue) {
    set_segments(fields, path.segments(), value);
}

fn set_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));

    let mut child_fields = match entry.kind() {
        ValueKind::Map(map) => map.fields().clone(),
        _ => BTreeMap::new(),
    };
    set_segments(&mut child_fields, rest, value);
    *entry = FirestoreValue::from_map(child_fields);
}

/// Removes the field at `path`; empty intermediate maps are pruned.
pub fn remove_field(fields: &mut BTreeMap<String, FirestoreValue>, path: &FieldPath) {
    remove_segments(fields, path.segments());
}

fn remove_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(value) = fields.get(first).cloned() {
        if let ValueKind::Map(child) = value.kind() {
            let mut child_fields = child.fields().clone();
            remove_segments(&mut child_fields, rest);
            if child_fields.is_empty() {
                fields.remove(first);
            } else {
                fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> MapValue {
        let mut inner = BTreeMap::new();
        inner.insert("city".to_string(), FirestoreValue::from_string("sf"));
        let mut outer = BTreeMap::new();
        outer.insert("address".to_string(), FirestoreValue::from_map(inner));
        MapValue::new(outer)
    }

    #[test]
    fn resolves_nested_paths() {
        let map = nested();
        let path = FieldPath::from_dot_separated("address.city").unwrap();
        assert_eq!(
            map.field(&path),
            Some(&FirestoreValue::from_string("sf"))
        );
        let missing = FieldPath::from_dot_separated("address.zip").unwrap();
        assert!(map.field(&missing).is_none());
    }

    #[test]
    fn set_materializes_intermediate_maps() {
        let mut fields = BTreeMap::new();
        let path = FieldPath::from_dot_separated("a.b.c").unwrap();
        set_field(&mut fields, &path, FirestoreValue::from_integer(1));
        let map = MapValue::new(fields);
        assert_eq!(map.field(&path), Some(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn remove_prunes_empty_parents() {
        let mut fields = nested().into_fields();
        let path = FieldPath::from_dot_separated("address.city").unwrap();
        remove_field(&mut fields, &path);
        assert!(fields.is_empty());
    }
}
