use chrono::{TimeZone, Utc};
use odbms_core::model::{Field, FieldKind, ModelSchema, Relationship};
use odbms_core::normalize::{document, relational};
use odbms_core::sql::{statement, Dialect};
use odbms_core::{record, Filter, Record, Value};

const TRACKING: [&str; 6] = ["007", "42", "TRK-9", "65A1F0C2B4D3E5F607182930", "-0", ""];

const DIALECTS: [Dialect; 3] = [Dialect::Sqlite, Dialect::MySql, Dialect::Postgres];

fn schema() -> ModelSchema {
    ModelSchema::new("Sample")
        .field(Field::string("name"))
        .field(Field::string("tracking_id"))
        .field(Field::integer("count"))
        .field(Field::float("ratio"))
        .field(Field::boolean("active"))
        .field(Field::datetime("seen_at"))
        .field(Field::json("meta"))
        .field(Field::list("labels", FieldKind::String))
        .field(Field::list("sizes", FieldKind::Integer))
        .relationship(Relationship::many_to_one("owner", "User"))
        .relationship(Relationship::many_to_many("members", "User"))
}

fn samples() -> Vec<Record> {
    (0..12)
        .map(|index: i64| {
            let labels: Vec<Value> = (0..index % 4).map(|n| Value::from(format!("l{n}"))).collect();
            let members: Vec<Value> = (1..=index % 3).map(|n| Value::from((n * 7).to_string())).collect();
            record([
                ("id", Value::from((index + 1).to_string())),
                ("name", Value::from(format!("sample {index}"))),
                ("tracking_id", Value::from(TRACKING[index as usize % TRACKING.len()])),
                ("count", Value::Int(index * 11 - 40)),
                ("ratio", Value::Float(index as f64 / 8.0)),
                ("active", Value::Bool(index % 2 == 0)),
                (
                    "seen_at",
                    Value::Timestamp(
                        Utc.with_ymd_and_hms(2024, 1 + (index as u32 % 12), 3, 4, 5, 6)
                            .unwrap(),
                    ),
                ),
                (
                    "meta",
                    Value::Map(record([
                        ("depth", Value::Int(index)),
                        ("tags", Value::from(vec!["a", "b"])),
                    ])),
                ),
                ("labels", Value::List(labels)),
                ("sizes", Value::List((0..index % 3).map(Value::Int).collect())),
                ("owner_id", Value::from((100 + index).to_string())),
                ("members_ids", Value::List(members)),
            ])
        })
        .collect()
}

#[test]
fn relational_round_trip_recovers_every_declared_type() {
    let schema = schema();
    for sample in samples() {
        let native = relational::encode_record(&sample).unwrap();
        let row = relational::decode_row(native);
        assert_eq!(schema.decode(row), sample);
    }
}

/// Same sample with 24-hex object ids in the identifier slots the document
/// store keys on; `tracking_id` keeps its plain text.
fn with_object_ids(sample: Record) -> Record {
    let mut sample = sample;
    sample.insert("id".to_string(), Value::from("65a1f0c2b4d3e5f607182930"));
    sample.insert("owner_id".to_string(), Value::from("65a1f0c2b4d3e5f607182931"));
    sample.insert(
        "members_ids".to_string(),
        Value::from(vec!["65a1f0c2b4d3e5f607182932"]),
    );
    sample
}

#[test]
fn relational_round_trip_keeps_text_under_identifier_keys() {
    let schema = schema();
    for tracking in TRACKING {
        let sample = record([("tracking_id", tracking)]);
        let row = relational::decode_row(relational::encode_record(&sample).unwrap());
        assert_eq!(schema.decode(row), sample);
    }
}

#[test]
fn document_round_trip_recovers_scalars_lists_and_maps() {
    for sample in samples().into_iter().map(with_object_ids) {
        let native = document::to_document(&sample).unwrap();
        assert!(native.contains_key("_id"));
        assert!(!native.contains_key("id"));
        assert_eq!(document::from_document(native).unwrap(), sample);
    }
}

#[test]
fn equality_filters_yield_one_clause_per_key() {
    let keys = ["alpha", "beta", "gamma", "delta", "epsilon"];
    for size in 1..=keys.len() {
        let filter = keys[..size]
            .iter()
            .fold(Filter::new(), |filter, key| filter.eq(*key, format!("{key}-value")));
        for dialect in DIALECTS {
            let statement = statement::select(dialect, "t", &filter, &[], None).unwrap();
            let (_, predicate) = statement.sql.split_once(" WHERE ").unwrap();
            let clauses: Vec<_> = predicate.split(" AND ").collect();
            assert_eq!(clauses.len(), size);
            assert!(clauses.iter().all(|clause| clause.contains(" = ")));
            assert!(!predicate.contains("$lt") && !predicate.contains("$in"));
            assert_eq!(statement.params.len(), size);
        }
    }
}

#[test]
fn set_filters_bind_one_parameter_per_element() {
    for size in 1..=6usize {
        let values: Vec<Value> = (0..size).map(|n| Value::from(format!("v{n}"))).collect();
        let included = Filter::new().is_in("name", values.clone());
        let excluded = Filter::new().not_in("name", values);
        for dialect in DIALECTS {
            for filter in [&included, &excluded] {
                let statement = statement::count(dialect, "t", filter).unwrap();
                assert_eq!(statement.params.len(), size);
                assert!(statement
                    .params
                    .iter()
                    .all(|param| !matches!(param, relational::SqlParam::Text(text) if text.contains(','))));
            }
        }
    }
}

#[test]
fn encoding_is_deterministic() {
    for sample in samples() {
        assert_eq!(
            relational::encode_record(&sample).unwrap(),
            relational::encode_record(&sample).unwrap()
        );
        let sample = with_object_ids(sample);
        assert_eq!(
            document::to_document(&sample).unwrap(),
            document::to_document(&sample).unwrap()
        );
    }
}
