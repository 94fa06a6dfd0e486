//! Table model shared by the facade and the store boundary

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// Maximum fractional-second precision accepted by `TIMESTAMP(p)`
pub const TIMESTAMP_PRECISION_MAX: u8 = 9;
const TIMESTAMP_PRECISION_DEFAULT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    String,
    Bytes,
    /// Milliseconds since the epoch with the given precision
    Timestamp(u8),
}

impl DataType {
    /// Parse a type name, accepting only known names
    pub fn parse_strict(name: &str) -> Option<DataType> {
        let upper = name.trim().to_ascii_uppercase();
        let parsed = match upper.as_str() {
            "BOOLEAN" => DataType::Boolean,
            "TINYINT" => DataType::TinyInt,
            "SMALLINT" => DataType::SmallInt,
            "INT" | "INTEGER" => DataType::Int,
            "BIGINT" => DataType::BigInt,
            "FLOAT" => DataType::Float,
            "DOUBLE" => DataType::Double,
            "STRING" => DataType::String,
            "BYTES" => DataType::Bytes,
            "TIMESTAMP" => DataType::Timestamp(TIMESTAMP_PRECISION_DEFAULT),
            other => {
                let precision = other
                    .strip_prefix("TIMESTAMP(")?
                    .strip_suffix(')')?
                    .trim()
                    .parse::<u8>()
                    .ok()?;
                if precision > TIMESTAMP_PRECISION_MAX {
                    return None;
                }
                DataType::Timestamp(precision)
            }
        };
        Some(parsed)
    }

    /// Parse a type name; unknown names become `STRING`
    pub fn parse(name: &str) -> DataType {
        DataType::parse_strict(name).unwrap_or_else(|| {
            warn!("Unknown data type {:?}, using STRING", name);
            DataType::String
        })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::TinyInt => write!(f, "TINYINT"),
            DataType::SmallInt => write!(f, "SMALLINT"),
            DataType::Int => write!(f, "INT"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::String => write!(f, "STRING"),
            DataType::Bytes => write!(f, "BYTES"),
            DataType::Timestamp(p) => write!(f, "TIMESTAMP({})", p),
        }
    }
}

/// A single typed cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Milliseconds since the epoch
    Timestamp(i64),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn to_json(&self) -> Value {
        match self {
            Datum::Null => Value::Null,
            Datum::Boolean(b) => json!(b),
            Datum::TinyInt(v) => json!(v),
            Datum::SmallInt(v) => json!(v),
            Datum::Int(v) => json!(v),
            Datum::BigInt(v) => json!(v),
            Datum::Float(v) => json!(v),
            Datum::Double(v) => json!(v),
            Datum::String(s) => json!(s),
            Datum::Bytes(b) => json!(b),
            Datum::Timestamp(ms) => json!(ms),
        }
    }
}

pub type Row = Vec<Datum>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
    pub primary_keys: Vec<String>,
}

impl Schema {
    /// Build a schema; primary key columns are non-nullable
    pub fn new(columns: Vec<(String, DataType)>, primary_keys: Vec<String>) -> Self {
        let fields = columns
            .into_iter()
            .map(|(name, data_type)| Field {
                nullable: !primary_keys.contains(&name),
                name,
                data_type,
            })
            .collect();
        Schema {
            fields,
            primary_keys,
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_keys.is_empty()
    }

    /// Positions of the primary key columns, in key order
    pub fn primary_key_indexes(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .filter_map(|k| self.field_index(k))
            .collect()
    }

    /// Structural checks a store applies before creating a table
    pub fn validate(&self) -> Result<(), String> {
        if self.fields.is_empty() {
            return Err("schema has no columns".to_string());
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(format!("column {} has an empty name", i));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(format!("duplicate column {}", field.name));
            }
        }
        for key in &self.primary_keys {
            if self.field_index(key).is_none() {
                return Err(format!("primary key {} is not a column", key));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TablePath {
    pub database: String,
    pub table: String,
}

impl TablePath {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        TablePath {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TablePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    AppendOnly,
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl ChangeType {
    pub fn name(self) -> &'static str {
        match self {
            ChangeType::AppendOnly => "APPEND_ONLY",
            ChangeType::Insert => "INSERT",
            ChangeType::UpdateBefore => "UPDATE_BEFORE",
            ChangeType::UpdateAfter => "UPDATE_AFTER",
            ChangeType::Delete => "DELETE",
        }
    }
}

/// One entry of a table's changelog
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub offset: i64,
    pub timestamp: i64,
    pub change_type: ChangeType,
    pub row: Row,
}

/// How a reader scans a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Bounded read of the current table contents
    Snapshot,
    /// Changelog read from the beginning
    Log,
    /// Bounded read used for key lookups
    Lookup,
}

impl ScanKind {
    /// Accepts `snapshot`/`batch`, `log`/`stream` and `lookup`, any case
    pub fn parse(name: &str) -> Option<ScanKind> {
        match name.trim().to_ascii_lowercase().as_str() {
            "snapshot" | "batch" => Some(ScanKind::Snapshot),
            "log" | "stream" => Some(ScanKind::Log),
            "lookup" => Some(ScanKind::Lookup),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScanKind::Snapshot => "snapshot",
            ScanKind::Log => "log",
            ScanKind::Lookup => "lookup",
        }
    }
}
