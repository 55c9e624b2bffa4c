use std::collections::BTreeMap;

use crate::model::{GeoPoint, Timestamp};
use crate::value::{ArrayValue, BytesValue, MapValue};

/// A single field value stored in a document.
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Sentinel transforms that may appear in user-supplied write data. They are
/// extracted into field transforms when the mutation is built and never reach
/// the document cache directly.
#[derive(Clone, Debug, PartialEq)]
pub enum SentinelValue {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(Box<FirestoreValue>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        ValueKind::Null.into()
    }

    pub fn from_bool(value: bool) -> Self {
        ValueKind::Boolean(value).into()
    }

    pub fn from_integer(value: i64) -> Self {
        ValueKind::Integer(value).into()
    }

    pub fn from_double(value: f64) -> Self {
        ValueKind::Double(value).into()
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        ValueKind::Timestamp(value).into()
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        ValueKind::String(value.into()).into()
    }

    pub fn from_bytes(value: impl Into<BytesValue>) -> Self {
        ValueKind::Bytes(value.into()).into()
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        ValueKind::Reference(path.into()).into()
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        ValueKind::GeoPoint(value).into()
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        ValueKind::Array(ArrayValue::new(values)).into()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        ValueKind::Map(MapValue::new(fields)).into()
    }

    /// Sentinel instructing the engine to populate the field with the commit
    /// timestamp of the write.
    pub fn server_timestamp() -> Self {
        ValueKind::Sentinel(SentinelValue::ServerTimestamp).into()
    }

    pub fn array_union(elements: Vec<FirestoreValue>) -> Self {
        ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)).into()
    }

    pub fn array_remove(elements: Vec<FirestoreValue>) -> Self {
        ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)).into()
    }

    pub fn numeric_increment(operand: FirestoreValue) -> Self {
        ValueKind::Sentinel(SentinelValue::NumericIncrement(Box::new(operand))).into()
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, ValueKind::Sentinel(_))
    }
}

impl From<ValueKind> for FirestoreValue {
    fn from(kind: ValueKind) -> Self {
        Self { kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_scalar_values() {
        match FirestoreValue::from_string("hello").kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(
            FirestoreValue::from_integer(7),
            FirestoreValue::from_integer(7)
        );
    }

    #[test]
    fn sentinels_are_flagged() {
        assert!(FirestoreValue::server_timestamp().is_sentinel());
        assert!(!FirestoreValue::null().is_sentinel());
    }
}
