//! Conversions between sheet values and SQLite storage.

use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};

use sheetline_engine::types::{DATE_FORMAT, DATETIME_FORMAT, TIME_FORMAT, duration_seconds};
use sheetline_engine::{FieldType, Value};

/// Format used for audit and metadata timestamps (matches `CURRENT_TIMESTAMP`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bound parameters per statement, below SQLite's default limit of 32766.
pub const MAX_PARAMS: usize = 32_000;

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated `?` placeholders.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub fn now_timestamp() -> String {
    Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string()
}

pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(*b as i64),
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Float(n) => SqlValue::Real(*n),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
        Value::DateTime(d) => SqlValue::Text(d.format(DATETIME_FORMAT).to_string()),
        Value::Time(t) => SqlValue::Text(t.format(TIME_FORMAT).to_string()),
        Value::Duration(d) => SqlValue::Real(duration_seconds(d)),
        Value::Binary(b) => SqlValue::Blob(b.clone()),
    }
}

/// Raw value as the driver returns it, before any cast.
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Integer(n),
        ValueRef::Real(n) => Value::Float(n),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Binary(b.to_vec()),
    }
}

/// Read a column and apply the read-time cast of its declared type.
pub fn read_value(value: ValueRef<'_>, field_type: Option<FieldType>) -> Value {
    let raw = from_sql(value);
    match field_type {
        Some(t) => t.cast(raw),
        None => raw,
    }
}

/// Field type inferred from a driver value, for raw query datasets.
pub fn infer_type(value: ValueRef<'_>) -> FieldType {
    match value {
        ValueRef::Integer(_) => FieldType::Integer,
        ValueRef::Real(_) => FieldType::Float,
        ValueRef::Blob(_) => FieldType::Binary,
        ValueRef::Null | ValueRef::Text(_) => FieldType::Text,
    }
}
