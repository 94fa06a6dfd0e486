//! Record conversion
//!
//! The peer speaks JSON objects keyed by column name; the store speaks
//! positional [`Row`]s. Values are coerced to the column type the way a
//! loosely typed caller expects: numbers from numeric strings, booleans
//! from `"true"`/`"false"`, timestamps from epoch milliseconds.

use super::store::StoreError;
use super::types::{DataType, Datum, Field, LogRecord, Row, Schema};
use serde_json::{json, Map, Value};
use tracing::debug;

pub type Record = Map<String, Value>;

/// Convert `record` to a row; missing columns become null
pub fn record_to_row(schema: &Schema, record: &Record) -> Result<Row, StoreError> {
    for key in record.keys() {
        if schema.field_index(key).is_none() {
            debug!("Ignoring unknown column {}", key);
        }
    }

    schema
        .fields
        .iter()
        .map(|field| match record.get(&field.name) {
            None | Some(Value::Null) => Ok(Datum::Null),
            Some(value) => coerce(field, value),
        })
        .collect()
}

fn coerce(field: &Field, value: &Value) -> Result<Datum, StoreError> {
    let invalid = || {
        StoreError::InvalidRow(format!(
            "column {} expects {}, got {}",
            field.name, field.data_type, value
        ))
    };

    let datum = match field.data_type {
        DataType::Boolean => match value {
            Value::Bool(b) => Datum::Boolean(*b),
            Value::String(s) => Datum::Boolean(s.trim().eq_ignore_ascii_case("true")),
            _ => return Err(invalid()),
        },
        DataType::TinyInt => Datum::TinyInt(i8::try_from(as_i64(value).ok_or_else(invalid)?).map_err(|_| invalid())?),
        DataType::SmallInt => {
            Datum::SmallInt(i16::try_from(as_i64(value).ok_or_else(invalid)?).map_err(|_| invalid())?)
        }
        DataType::Int => Datum::Int(i32::try_from(as_i64(value).ok_or_else(invalid)?).map_err(|_| invalid())?),
        DataType::BigInt => Datum::BigInt(as_i64(value).ok_or_else(invalid)?),
        DataType::Float => Datum::Float(as_f64(value).ok_or_else(invalid)? as f32),
        DataType::Double => Datum::Double(as_f64(value).ok_or_else(invalid)?),
        DataType::String => match value {
            Value::String(s) => Datum::String(s.clone()),
            other => Datum::String(other.to_string()),
        },
        DataType::Bytes => match value {
            Value::String(s) => Datum::Bytes(s.as_bytes().to_vec()),
            Value::Array(items) => Datum::Bytes(
                items
                    .iter()
                    .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(invalid)?,
            ),
            _ => return Err(invalid()),
        },
        DataType::Timestamp(_) => Datum::Timestamp(as_i64(value).ok_or_else(invalid)?),
    };
    Ok(datum)
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Convert a scanned row; `_row_index` is its position in the result
pub fn row_to_record(schema: &Schema, row: &Row, index: usize) -> Record {
    let mut record = Map::new();
    record.insert("_row_index".to_string(), json!(index));
    for (i, datum) in row.iter().enumerate() {
        let name = schema
            .fields
            .get(i)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| format!("field_{}", i));
        record.insert(name, datum.to_json());
    }
    record
}

/// Convert a changelog entry; adds offset, timestamp and change type
pub fn log_record_to_record(schema: &Schema, log: &LogRecord, index: usize) -> Record {
    let mut record = row_to_record(schema, &log.row, index);
    record.insert("_log_offset".to_string(), json!(log.offset));
    record.insert("_timestamp".to_string(), json!(log.timestamp));
    record.insert("_change_type".to_string(), json!(log.change_type.name()));
    record
}

/// Column descriptions: name, type, nullable, index
pub fn schema_fields(schema: &Schema) -> Vec<Value> {
    schema
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| {
            json!({
                "name": f.name,
                "type": f.data_type.to_string(),
                "nullable": f.nullable,
                "index": i,
            })
        })
        .collect()
}

pub fn schema_to_map(schema: &Schema) -> Record {
    let mut map = Map::new();
    map.insert("fields".to_string(), Value::Array(schema_fields(schema)));
    map.insert("field_count".to_string(), json!(schema.fields.len()));
    map.insert(
        "field_names".to_string(),
        json!(schema.field_names().collect::<Vec<_>>()),
    );
    if schema.has_primary_key() {
        map.insert("primary_key".to_string(), json!(schema.primary_keys));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::types::ChangeType;

    fn schema() -> Schema {
        Schema::new(
            vec![
                ("id".into(), DataType::BigInt),
                ("name".into(), DataType::String),
                ("age".into(), DataType::Int),
                ("active".into(), DataType::Boolean),
                ("created_time".into(), DataType::Timestamp(3)),
            ],
            vec!["id".into()],
        )
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_record_to_row_coerces_loose_values() {
        let row = record_to_row(
            &schema(),
            &record(json!({
                "id": "42",
                "name": 7,
                "age": 30.0,
                "active": "TRUE",
                "created_time": 1_700_000_000_000i64,
                "extra": "ignored",
            })),
        )
        .unwrap();

        assert_eq!(
            row,
            vec![
                Datum::BigInt(42),
                Datum::String("7".into()),
                Datum::Int(30),
                Datum::Boolean(true),
                Datum::Timestamp(1_700_000_000_000),
            ]
        );
    }

    #[test]
    fn test_missing_columns_are_null() {
        let row = record_to_row(&schema(), &record(json!({ "id": 1 }))).unwrap();
        assert_eq!(row[0], Datum::BigInt(1));
        assert!(row[1..].iter().all(Datum::is_null));
    }

    #[test]
    fn test_uncoercible_value_is_rejected() {
        let err = record_to_row(&schema(), &record(json!({ "id": "abc" }))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow(_)));

        let err = record_to_row(&schema(), &record(json!({ "id": 1, "age": 1e12 }))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow(_)));
    }

    #[test]
    fn test_log_record_metadata() {
        let log = LogRecord {
            offset: 5,
            timestamp: 1000,
            change_type: ChangeType::Insert,
            row: vec![
                Datum::BigInt(1),
                Datum::String("a".into()),
                Datum::Null,
                Datum::Null,
                Datum::Null,
            ],
        };
        let rec = log_record_to_record(&schema(), &log, 0);
        assert_eq!(rec["_row_index"], json!(0));
        assert_eq!(rec["_log_offset"], json!(5));
        assert_eq!(rec["_change_type"], json!("INSERT"));
        assert_eq!(rec["name"], json!("a"));
    }

    #[test]
    fn test_schema_to_map() {
        let map = schema_to_map(&schema());
        assert_eq!(map["field_count"], json!(5));
        assert_eq!(map["primary_key"], json!(["id"]));
        assert_eq!(map["fields"][4]["type"], json!("TIMESTAMP(3)"));
        assert_eq!(map["fields"][0]["nullable"], json!(false));
    }
}
