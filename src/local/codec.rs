use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::error::{internal_error, FirestoreResult};
use crate::model::{
    Document, DocumentKey, FieldPath, FieldTransform, GeoPoint, Mutation, MutationBatch,
    Precondition, Timestamp, TransformOperation,
};
use crate::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// JSON codec for everything the engine persists: documents, mutation
/// batches, and target metadata. The value encoding follows the Firestore
/// JSON-proto shape (`{"integerValue": "42"}` and friends) so persisted
/// payloads stay readable and versionable.

pub fn encode_value(value: &FirestoreValue) -> FirestoreResult<Value> {
    let encoded = match value.kind() {
        ValueKind::Null => json!({ "nullValue": null }),
        ValueKind::Boolean(b) => json!({ "booleanValue": b }),
        ValueKind::Integer(i) => json!({ "integerValue": i.to_string() }),
        ValueKind::Double(d) => json!({ "doubleValue": d }),
        ValueKind::Timestamp(ts) => {
            json!({ "timestampValue": { "seconds": ts.seconds, "nanos": ts.nanos } })
        }
        ValueKind::String(s) => json!({ "stringValue": s }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(path) => json!({ "referenceValue": path }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": { "latitude": point.latitude(), "longitude": point.longitude() }
        }),
        ValueKind::Array(array) => {
            let values: FirestoreResult<Vec<Value>> =
                array.values().iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values? } })
        }
        ValueKind::Map(map) => json!({ "mapValue": { "fields": encode_fields(map)? } }),
        ValueKind::Sentinel(_) => {
            return Err(internal_error(
                "Sentinel values must be rewritten into transforms before persisting",
            ))
        }
    };
    Ok(encoded)
}

pub fn encode_fields(map: &MapValue) -> FirestoreResult<Value> {
    let mut fields = Map::new();
    for (name, value) in map.fields() {
        fields.insert(name.clone(), encode_value(value)?);
    }
    Ok(Value::Object(fields))
}

pub fn decode_value(value: &Value) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| internal_error("Encoded value must be a JSON object"))?;
    let (tag, payload) = object
        .iter()
        .next()
        .ok_or_else(|| internal_error("Encoded value object is empty"))?;

    let decoded = match tag.as_str() {
        "nullValue" => FirestoreValue::null(),
        "booleanValue" => FirestoreValue::from_bool(
            payload
                .as_bool()
                .ok_or_else(|| internal_error("booleanValue must be a bool"))?,
        ),
        "integerValue" => {
            let raw = payload
                .as_str()
                .ok_or_else(|| internal_error("integerValue must be a string"))?;
            FirestoreValue::from_integer(
                raw.parse::<i64>()
                    .map_err(|err| internal_error(format!("bad integerValue: {err}")))?,
            )
        }
        "doubleValue" => FirestoreValue::from_double(
            payload
                .as_f64()
                .ok_or_else(|| internal_error("doubleValue must be a number"))?,
        ),
        "timestampValue" => FirestoreValue::from_timestamp(decode_timestamp(payload)?),
        "stringValue" => FirestoreValue::from_string(
            payload
                .as_str()
                .ok_or_else(|| internal_error("stringValue must be a string"))?,
        ),
        "bytesValue" => {
            let raw = payload
                .as_str()
                .ok_or_else(|| internal_error("bytesValue must be a string"))?;
            let bytes = BASE64_STANDARD
                .decode(raw)
                .map_err(|err| internal_error(format!("bad bytesValue: {err}")))?;
            FirestoreValue::from_bytes(BytesValue::new(bytes))
        }
        "referenceValue" => FirestoreValue::from_reference(
            payload
                .as_str()
                .ok_or_else(|| internal_error("referenceValue must be a string"))?,
        ),
        "geoPointValue" => {
            let latitude = payload
                .get("latitude")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let longitude = payload
                .get("longitude")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            FirestoreValue::from_geo_point(
                GeoPoint::new(latitude, longitude)
                    .map_err(|err| internal_error(format!("bad geoPointValue: {err}")))?,
            )
        }
        "arrayValue" => {
            let values = payload
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            FirestoreValue::from_array(values)
        }
        "mapValue" => {
            let fields = payload
                .get("fields")
                .map(decode_fields)
                .transpose()?
                .unwrap_or_default();
            FirestoreValue::from_map(fields.into_fields())
        }
        other => return Err(internal_error(format!("Unknown value tag '{other}'"))),
    };
    Ok(decoded)
}

pub fn decode_fields(value: &Value) -> FirestoreResult<MapValue> {
    let object = value
        .as_object()
        .ok_or_else(|| internal_error("Encoded fields must be a JSON object"))?;
    let mut fields = BTreeMap::new();
    for (name, value) in object {
        fields.insert(name.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn encode_timestamp(ts: Timestamp) -> Value {
    json!({ "seconds": ts.seconds, "nanos": ts.nanos })
}

fn decode_timestamp(value: &Value) -> FirestoreResult<Timestamp> {
    let seconds = value
        .get("seconds")
        .and_then(Value::as_i64)
        .ok_or_else(|| internal_error("timestamp missing seconds"))?;
    let nanos = value
        .get("nanos")
        .and_then(Value::as_i64)
        .ok_or_else(|| internal_error("timestamp missing nanos"))? as i32;
    Ok(Timestamp::new(seconds, nanos))
}

pub fn encode_document(document: &Document) -> FirestoreResult<String> {
    let fields = document.fields().map(encode_fields).transpose()?;
    let payload = json!({
        "key": document.key().canonical_string(),
        "version": encode_timestamp(document.version()),
        "fields": fields,
    });
    Ok(payload.to_string())
}

pub fn decode_document(raw: &str) -> FirestoreResult<Document> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| internal_error(format!("bad persisted document: {err}")))?;
    let key = value
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| internal_error("persisted document missing key"))?;
    let key = DocumentKey::from_string(key)?;
    let version = decode_timestamp(
        value
            .get("version")
            .ok_or_else(|| internal_error("persisted document missing version"))?,
    )?;
    match value.get("fields") {
        Some(Value::Null) | None => Ok(Document::missing(key, version)),
        Some(fields) => Ok(Document::found(key, version, decode_fields(fields)?)),
    }
}

fn encode_field_paths(paths: &[FieldPath]) -> Value {
    Value::Array(
        paths
            .iter()
            .map(|path| Value::String(path.canonical_string()))
            .collect(),
    )
}

fn decode_field_paths(value: &Value) -> FirestoreResult<Vec<FieldPath>> {
    value
        .as_array()
        .ok_or_else(|| internal_error("field paths must be an array"))?
        .iter()
        .map(|entry| {
            let raw = entry
                .as_str()
                .ok_or_else(|| internal_error("field path must be a string"))?;
            FieldPath::from_dot_separated(raw)
        })
        .collect()
}

fn encode_transform(transform: &FieldTransform) -> FirestoreResult<Value> {
    let operation = match transform.operation() {
        TransformOperation::ServerTimestamp => json!({ "serverTimestamp": true }),
        TransformOperation::ArrayUnion(elements) => {
            let values: FirestoreResult<Vec<Value>> = elements.iter().map(encode_value).collect();
            json!({ "arrayUnion": values? })
        }
        TransformOperation::ArrayRemove(elements) => {
            let values: FirestoreResult<Vec<Value>> = elements.iter().map(encode_value).collect();
            json!({ "arrayRemove": values? })
        }
        TransformOperation::NumericIncrement(operand) => {
            json!({ "increment": encode_value(operand)? })
        }
    };
    Ok(json!({
        "field": transform.field().canonical_string(),
        "operation": operation,
    }))
}

fn decode_transform(value: &Value) -> FirestoreResult<FieldTransform> {
    let field = value
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| internal_error("transform missing field"))?;
    let field = FieldPath::from_dot_separated(field)?;
    let operation = value
        .get("operation")
        .and_then(Value::as_object)
        .ok_or_else(|| internal_error("transform missing operation"))?;
    let (tag, payload) = operation
        .iter()
        .next()
        .ok_or_else(|| internal_error("transform operation is empty"))?;
    let operation = match tag.as_str() {
        "serverTimestamp" => TransformOperation::ServerTimestamp,
        "arrayUnion" => TransformOperation::ArrayUnion(decode_value_list(payload)?),
        "arrayRemove" => TransformOperation::ArrayRemove(decode_value_list(payload)?),
        "increment" => TransformOperation::NumericIncrement(decode_value(payload)?),
        other => return Err(internal_error(format!("unknown transform '{other}'"))),
    };
    Ok(FieldTransform::new(field, operation))
}

fn decode_value_list(value: &Value) -> FirestoreResult<Vec<FirestoreValue>> {
    value
        .as_array()
        .ok_or_else(|| internal_error("transform elements must be an array"))?
        .iter()
        .map(decode_value)
        .collect()
}

fn encode_precondition(precondition: &Precondition) -> Value {
    match precondition {
        Precondition::None => Value::Null,
        Precondition::Exists(exists) => json!({ "exists": exists }),
        Precondition::UpdateTime(version) => json!({ "updateTime": encode_timestamp(*version) }),
    }
}

fn decode_precondition(value: Option<&Value>) -> FirestoreResult<Precondition> {
    match value {
        None | Some(Value::Null) => Ok(Precondition::None),
        Some(value) => {
            if let Some(exists) = value.get("exists").and_then(Value::as_bool) {
                Ok(Precondition::Exists(exists))
            } else if let Some(version) = value.get("updateTime") {
                Ok(Precondition::UpdateTime(decode_timestamp(version)?))
            } else {
                Err(internal_error("unknown precondition shape"))
            }
        }
    }
}

fn encode_mutation(mutation: &Mutation) -> FirestoreResult<Value> {
    let encoded = match mutation {
        Mutation::Set {
            key,
            data,
            mask,
            transforms,
            precondition,
        } => {
            let transforms: FirestoreResult<Vec<Value>> =
                transforms.iter().map(encode_transform).collect();
            json!({
                "type": "set",
                "key": key.canonical_string(),
                "data": encode_fields(data)?,
                "mask": mask.as_ref().map(|mask| encode_field_paths(mask)),
                "transforms": transforms?,
                "precondition": encode_precondition(precondition),
            })
        }
        Mutation::Patch {
            key,
            data,
            field_paths,
            transforms,
            precondition,
        } => {
            let transforms: FirestoreResult<Vec<Value>> =
                transforms.iter().map(encode_transform).collect();
            json!({
                "type": "patch",
                "key": key.canonical_string(),
                "data": encode_fields(data)?,
                "fieldPaths": encode_field_paths(field_paths),
                "transforms": transforms?,
                "precondition": encode_precondition(precondition),
            })
        }
        Mutation::Delete { key, precondition } => json!({
            "type": "delete",
            "key": key.canonical_string(),
            "precondition": encode_precondition(precondition),
        }),
    };
    Ok(encoded)
}

fn decode_mutation(value: &Value) -> FirestoreResult<Mutation> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| internal_error("mutation missing type"))?;
    let key = value
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| internal_error("mutation missing key"))?;
    let key = DocumentKey::from_string(key)?;
    let precondition = decode_precondition(value.get("precondition"))?;

    match kind {
        "set" => Ok(Mutation::Set {
            key,
            data: decode_fields(
                value
                    .get("data")
                    .ok_or_else(|| internal_error("set mutation missing data"))?,
            )?,
            mask: match value.get("mask") {
                None | Some(Value::Null) => None,
                Some(mask) => Some(decode_field_paths(mask)?),
            },
            transforms: decode_transforms(value)?,
            precondition,
        }),
        "patch" => Ok(Mutation::Patch {
            key,
            data: decode_fields(
                value
                    .get("data")
                    .ok_or_else(|| internal_error("patch mutation missing data"))?,
            )?,
            field_paths: decode_field_paths(
                value
                    .get("fieldPaths")
                    .ok_or_else(|| internal_error("patch mutation missing fieldPaths"))?,
            )?,
            transforms: decode_transforms(value)?,
            precondition,
        }),
        "delete" => Ok(Mutation::Delete { key, precondition }),
        other => Err(internal_error(format!("unknown mutation type '{other}'"))),
    }
}

fn decode_transforms(value: &Value) -> FirestoreResult<Vec<FieldTransform>> {
    match value.get("transforms") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(transforms) => transforms
            .as_array()
            .ok_or_else(|| internal_error("transforms must be an array"))?
            .iter()
            .map(decode_transform)
            .collect(),
    }
}

pub fn encode_mutation_batch(batch: &MutationBatch) -> FirestoreResult<String> {
    let mutations: FirestoreResult<Vec<Value>> =
        batch.mutations.iter().map(encode_mutation).collect();
    let payload = json!({
        "batchId": batch.batch_id,
        "localWriteTime": encode_timestamp(batch.local_write_time),
        "mutations": mutations?,
    });
    Ok(payload.to_string())
}

pub fn decode_mutation_batch(raw: &str) -> FirestoreResult<MutationBatch> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| internal_error(format!("bad persisted mutation batch: {err}")))?;
    let batch_id = value
        .get("batchId")
        .and_then(Value::as_i64)
        .ok_or_else(|| internal_error("mutation batch missing batchId"))? as i32;
    let local_write_time = decode_timestamp(
        value
            .get("localWriteTime")
            .ok_or_else(|| internal_error("mutation batch missing localWriteTime"))?,
    )?;
    let mutations = value
        .get("mutations")
        .and_then(Value::as_array)
        .ok_or_else(|| internal_error("mutation batch missing mutations"))?
        .iter()
        .map(decode_mutation)
        .collect::<FirestoreResult<Vec<_>>>()?;
    Ok(MutationBatch::new(batch_id, local_write_time, mutations))
}

pub fn encode_resume_token(token: &[u8]) -> String {
    BASE64_STANDARD.encode(token)
}

pub fn decode_resume_token(raw: &str) -> FirestoreResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(raw)
        .map_err(|err| internal_error(format!("bad resume token: {err}")))
}

pub fn encode_timestamp_value(ts: Timestamp) -> Value {
    encode_timestamp(ts)
}

pub fn decode_timestamp_value(value: &Value) -> FirestoreResult<Timestamp> {
    decode_timestamp(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentKey;

    fn sample_fields() -> MapValue {
        let mut nested = BTreeMap::new();
        nested.insert("city".to_string(), FirestoreValue::from_string("sf"));
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string("SF"));
        fields.insert("population".to_string(), FirestoreValue::from_integer(873_965));
        fields.insert("score".to_string(), FirestoreValue::from_double(4.5));
        fields.insert(
            "tags".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::from_string("bay")]),
        );
        fields.insert("address".to_string(), FirestoreValue::from_map(nested));
        fields.insert("missing".to_string(), FirestoreValue::null());
        MapValue::new(fields)
    }

    #[test]
    fn document_round_trip() {
        let document = Document::found(
            DocumentKey::from_string("cities/sf").unwrap(),
            Timestamp::new(12, 34),
            sample_fields(),
        );
        let decoded = decode_document(&encode_document(&document).unwrap()).unwrap();
        assert_eq!(decoded, document);
    }

    #[test]
    fn missing_document_round_trip() {
        let document = Document::missing(
            DocumentKey::from_string("cities/atlantis").unwrap(),
            Timestamp::new(99, 0),
        );
        let decoded = decode_document(&encode_document(&document).unwrap()).unwrap();
        assert!(!decoded.exists());
        assert_eq!(decoded.version(), Timestamp::new(99, 0));
    }

    #[test]
    fn mutation_batch_round_trip() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let batch = MutationBatch::new(
            7,
            Timestamp::new(5, 0),
            vec![
                Mutation::set(key.clone(), sample_fields()).with_transforms(vec![
                    FieldTransform::new(
                        FieldPath::from_dot_separated("population").unwrap(),
                        TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
                    ),
                ]),
                Mutation::patch(
                    key.clone(),
                    sample_fields(),
                    vec![FieldPath::from_dot_separated("name").unwrap()],
                ),
                Mutation::delete(key),
            ],
        );
        let decoded = decode_mutation_batch(&encode_mutation_batch(&batch).unwrap()).unwrap();
        assert_eq!(decoded.batch_id, 7);
        assert_eq!(decoded.mutations, batch.mutations);
    }

    #[test]
    fn sentinel_values_refuse_to_persist() {
        let err = encode_value(&FirestoreValue::server_timestamp()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }
}
