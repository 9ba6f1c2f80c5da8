//! Canonical <-> BSON document encoding.
//!
//! # Responsibility
//! - Rename `id` <-> `_id` and translate hex text <-> `ObjectId`.
//! - Encode `*_id` / `*_ids` identifier fields symmetrically.
//! - Turn canonical filters into MongoDB query documents.
//!
//! # Invariants
//! - A supplied canonical `id` must be a 24-hex string; anything else is a
//!   `NormalizationError`, never a silently stored string key.
//! - Timestamps round-trip at millisecond precision.

use super::{is_identifier_key, is_identifier_list_key};
use crate::error::NormalizationError;
use crate::filter::{Condition, Filter};
use crate::value::{Record, Value};
use chrono::{TimeZone, Utc};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, DateTime as BsonDateTime, Document};

pub const NATIVE_ID: &str = "_id";

fn native_key(key: &str) -> &str {
    if key == "id" {
        NATIVE_ID
    } else {
        key
    }
}

fn encode_id(key: &str, value: &Value) -> Result<Bson, NormalizationError> {
    match value {
        Value::Null => Ok(Bson::Null),
        Value::Text(text) => ObjectId::parse_str(text)
            .map(Bson::ObjectId)
            .map_err(|_| NormalizationError::InvalidObjectId {
                key: key.to_string(),
                value: text.clone(),
            }),
        other => Err(NormalizationError::InvalidObjectId {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Reference fields keep text that is not a lowercase object id as plain
/// strings, so it reads back unchanged.
fn encode_reference(value: &Value) -> Option<Bson> {
    value
        .as_str()
        .and_then(|text| ObjectId::parse_str(text).ok().filter(|oid| oid.to_hex() == text))
        .map(Bson::ObjectId)
}

/// Encodes one canonical value stored under `key`.
pub fn encode_value(key: &str, value: &Value) -> Result<Bson, NormalizationError> {
    if key == "id" {
        return encode_id(key, value);
    }
    if is_identifier_key(key) {
        if let Some(oid) = encode_reference(value) {
            return Ok(oid);
        }
    }
    if is_identifier_list_key(key) {
        if let Value::List(items) = value {
            let encoded = items
                .iter()
                .map(|item| encode_reference(item).map_or_else(|| encode_plain(key, item), Ok))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Bson::Array(encoded));
        }
    }
    encode_plain(key, value)
}

fn encode_plain(key: &str, value: &Value) -> Result<Bson, NormalizationError> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(flag) => Bson::Boolean(*flag),
        Value::Int(number) => Bson::Int64(*number),
        Value::Float(number) => Bson::Double(*number),
        Value::Text(text) => Bson::String(text.clone()),
        Value::Timestamp(at) => Bson::DateTime(BsonDateTime::from_millis(at.timestamp_millis())),
        Value::List(items) => Bson::Array(
            items
                .iter()
                .map(|item| encode_plain(key, item))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => Bson::Document(encode_nested(map)?),
    })
}

fn encode_nested(map: &Record) -> Result<Document, NormalizationError> {
    let mut document = Document::new();
    for (key, value) in map {
        document.insert(key.clone(), encode_plain(key, value)?);
    }
    Ok(document)
}

/// Encodes a canonical record; a null `id` is omitted so the store assigns one.
pub fn to_document(record: &Record) -> Result<Document, NormalizationError> {
    let mut document = Document::new();
    for (key, value) in record {
        if key == "id" && value.is_null() {
            continue;
        }
        document.insert(native_key(key), encode_value(key, value)?);
    }
    Ok(document)
}

/// Encodes an update patch; `id` is immutable and therefore dropped.
pub fn patch_to_document(patch: &Record) -> Result<Document, NormalizationError> {
    let mut document = Document::new();
    for (key, value) in patch.iter().filter(|(key, _)| key.as_str() != "id") {
        document.insert(key.clone(), encode_value(key, value)?);
    }
    Ok(document)
}

/// Decodes one BSON value read under `key`.
pub fn decode_value(key: &str, value: Bson) -> Result<Value, NormalizationError> {
    Ok(match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(flag) => Value::Bool(flag),
        Bson::Int32(number) => Value::Int(number.into()),
        Bson::Int64(number) => Value::Int(number),
        Bson::Double(number) => Value::Float(number),
        Bson::String(text) => Value::Text(text),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(at) => Utc
            .timestamp_millis_opt(at.timestamp_millis())
            .single()
            .map(Value::Timestamp)
            .ok_or_else(|| NormalizationError::Unrepresentable {
                key: key.to_string(),
                reason: format!("datetime {} is out of range", at.timestamp_millis()),
            })?,
        Bson::Array(items) => Value::List(
            items
                .into_iter()
                .map(|item| decode_value(key, item))
                .collect::<Result<_, _>>()?,
        ),
        Bson::Document(document) => Value::Map(decode_nested(document)?),
        decimal @ Bson::Decimal128(_) => match decimal.into_relaxed_extjson() {
            serde_json::Value::Object(mut map) => match map.remove("$numberDecimal") {
                Some(serde_json::Value::String(text)) => Value::Text(text),
                _ => Value::Null,
            },
            other => Value::Text(other.to_string()),
        },
        other => {
            return Err(NormalizationError::UnsupportedColumnType {
                column: key.to_string(),
                type_name: format!("{:?}", other.element_type()),
            })
        }
    })
}

fn decode_nested(document: Document) -> Result<Record, NormalizationError> {
    document
        .into_iter()
        .map(|(key, value)| decode_value(&key, value).map(|value| (key, value)))
        .collect()
}

/// Decodes a stored document, renaming `_id` to `id`.
pub fn from_document(document: Document) -> Result<Record, NormalizationError> {
    let mut record = Record::new();
    for (key, value) in document {
        let key = if key == NATIVE_ID { "id".to_string() } else { key };
        let value = decode_value(&key, value)?;
        record.insert(key, value);
    }
    Ok(record)
}

/// Translates a canonical filter into a MongoDB query document.
pub fn filter_to_document(filter: &Filter) -> Result<Document, NormalizationError> {
    filter.check()?;
    let mut query = Document::new();
    for (key, condition) in filter {
        let encoded = match condition {
            Condition::Eq(value) => encode_value(key, value)?,
            Condition::Ops(ops) => {
                let mut sub = Document::new();
                for (op, operand) in ops {
                    let operand = match operand {
                        Value::List(items) if op.is_set_operator() => Bson::Array(
                            items
                                .iter()
                                .map(|item| encode_value(key, item))
                                .collect::<Result<_, _>>()?,
                        ),
                        other => encode_value(key, other)?,
                    };
                    sub.insert(op.token(), operand);
                }
                Bson::Document(sub)
            }
        };
        query.insert(native_key(key), encoded);
    }
    Ok(query)
}

/// Inclusion projection; `None` when every field is wanted.
pub fn projection(fields: &[&str]) -> Option<Document> {
    if fields.is_empty() {
        return None;
    }
    let mut document = Document::new();
    for field in fields {
        document.insert(native_key(field), 1_i32);
    }
    Some(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::record;
    use mongodb::bson::doc;

    const HEX: &str = "65a1b2c3d4e5f60718293a4b";

    #[test]
    fn id_is_renamed_and_parsed() {
        let input = record([("id", Value::from(HEX)), ("name", Value::from("Ann"))]);
        let document = to_document(&input).unwrap();
        assert!(matches!(document.get("_id"), Some(Bson::ObjectId(_))));
        assert!(!document.contains_key("id"));

        let back = from_document(document).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn malformed_id_is_rejected() {
        let input = record([("id", Value::from("not-an-object-id"))]);
        assert!(matches!(
            to_document(&input),
            Err(NormalizationError::InvalidObjectId { .. })
        ));
    }

    #[test]
    fn reference_fields_round_trip_as_object_ids() {
        let input = record([
            ("owner_id", Value::from(HEX)),
            ("tag_ids", Value::from(vec![HEX, HEX])),
        ]);
        let document = to_document(&input).unwrap();
        assert!(matches!(document.get("owner_id"), Some(Bson::ObjectId(_))));
        match document.get("tag_ids") {
            Some(Bson::Array(items)) => {
                assert!(items.iter().all(|item| matches!(item, Bson::ObjectId(_))))
            }
            other => panic!("unexpected tag_ids: {other:?}"),
        }
        assert_eq!(from_document(document).unwrap(), input);
    }

    #[test]
    fn reference_keys_keep_text_that_is_not_a_lowercase_object_id() {
        let upper = HEX.to_uppercase();
        let input = record([
            ("tracking_id", Value::from("007")),
            ("parcel_id", Value::from(upper.as_str())),
        ]);
        let document = to_document(&input).unwrap();
        assert_eq!(document.get("tracking_id"), Some(&Bson::String("007".to_string())));
        assert_eq!(document.get("parcel_id"), Some(&Bson::String(upper.clone())));
        assert_eq!(from_document(document).unwrap(), input);
    }

    #[test]
    fn timestamps_keep_millisecond_precision() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let input = record([("seen_at", Value::Timestamp(at))]);
        let back = from_document(to_document(&input).unwrap()).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn filters_translate_operators_and_ids() {
        let filter = Filter::new()
            .eq("id", HEX)
            .gte("age", 18)
            .is_in("status", vec!["new", "open"]);
        let query = filter_to_document(&filter).unwrap();
        let oid = ObjectId::parse_str(HEX).unwrap();
        assert_eq!(
            query,
            doc! {
                "age": { "$gte": 18_i64 },
                "_id": oid,
                "status": { "$in": ["new", "open"] },
            }
        );
    }

    #[test]
    fn int32_and_int64_both_decode_to_integers() {
        let back = from_document(doc! { "a": 1_i32, "b": 2_i64 }).unwrap();
        assert_eq!(back["a"], Value::Int(1));
        assert_eq!(back["b"], Value::Int(2));
    }
}
