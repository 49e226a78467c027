//! Field kinds and the values that flow through sheets.
//!
//! Every column of a materialized sheet has a [`FieldType`]. The fixed
//! [`FIELD_TYPES`] table maps each kind to:
//!
//! - the storage type used when the column is created
//! - the field kind reported to host models and views
//! - a parser that coerces arbitrary values into the kind
//! - an optional read-time cast applied to values coming back from storage

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
pub const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// A single scalar value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Duration(TimeDelta),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Duration(d) => Some(duration_seconds(d)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Float(n) if n.is_finite() => Some(n.trunc() as i64),
            Value::Boolean(b) => Some(*b as i64),
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|n| n.is_finite()).map(|n| n.trunc() as i64))
            }
            _ => None,
        }
    }

    /// Name of the storage class of this value, used in messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Binary(_) => "binary",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Value::DateTime(d) => write!(f, "{}", d.format(DATETIME_FORMAT)),
            Value::Time(t) => write!(f, "{}", t.format(TIME_FORMAT)),
            Value::Duration(d) => write!(f, "{}s", duration_seconds(d)),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

pub fn duration_seconds(d: &TimeDelta) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Logical field kinds a formula or table column can declare.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Decimal,
    Boolean,
    Link,
    Date,
    DateTime,
    Time,
    Timestamp,
    Duration,
    Icon,
    Image,
    Binary,
    Reference,
}

/// One row of the type catalog.
pub struct FieldTypeInfo {
    pub kind: FieldType,
    pub name: &'static str,
    pub label: &'static str,
    /// Column type used when provisioning physical tables.
    pub sql_type: &'static str,
    /// Field kind as understood by host models and view renderers.
    pub host_kind: &'static str,
    pub parse: fn(Value) -> Value,
    pub cast: Option<fn(Value) -> Value>,
}

pub const FIELD_TYPES: &[FieldTypeInfo] = &[
    FieldTypeInfo {
        kind: FieldType::Text,
        name: "text",
        label: "Text",
        sql_type: "VARCHAR",
        host_kind: "char",
        parse: parse_text,
        cast: None,
    },
    FieldTypeInfo {
        kind: FieldType::Integer,
        name: "integer",
        label: "Integer",
        sql_type: "INTEGER",
        host_kind: "integer",
        parse: parse_integer,
        cast: Some(parse_integer),
    },
    FieldTypeInfo {
        kind: FieldType::Float,
        name: "float",
        label: "Float",
        sql_type: "FLOAT",
        host_kind: "float",
        parse: parse_float,
        cast: Some(parse_float),
    },
    FieldTypeInfo {
        kind: FieldType::Decimal,
        name: "decimal",
        label: "Decimal",
        sql_type: "NUMERIC",
        host_kind: "numeric",
        parse: parse_float,
        cast: Some(parse_float),
    },
    FieldTypeInfo {
        kind: FieldType::Boolean,
        name: "boolean",
        label: "Boolean",
        sql_type: "BOOLEAN",
        host_kind: "boolean",
        parse: parse_boolean,
        cast: Some(parse_boolean),
    },
    FieldTypeInfo {
        kind: FieldType::Link,
        name: "link",
        label: "Link",
        sql_type: "INTEGER",
        host_kind: "many2one",
        parse: parse_integer,
        cast: None,
    },
    FieldTypeInfo {
        kind: FieldType::Date,
        name: "date",
        label: "Date",
        sql_type: "DATE",
        host_kind: "date",
        parse: parse_date,
        cast: Some(parse_date),
    },
    FieldTypeInfo {
        kind: FieldType::DateTime,
        name: "datetime",
        label: "Date Time",
        sql_type: "DATETIME",
        host_kind: "datetime",
        parse: parse_datetime,
        cast: Some(parse_datetime),
    },
    FieldTypeInfo {
        kind: FieldType::Time,
        name: "time",
        label: "Time",
        sql_type: "TIME",
        host_kind: "time",
        parse: parse_time,
        cast: Some(parse_time),
    },
    FieldTypeInfo {
        kind: FieldType::Timestamp,
        name: "timestamp",
        label: "Timestamp",
        sql_type: "TIMESTAMP",
        host_kind: "timestamp",
        parse: parse_datetime,
        cast: Some(parse_datetime),
    },
    FieldTypeInfo {
        kind: FieldType::Duration,
        name: "duration",
        label: "Time Interval",
        sql_type: "INTERVAL",
        host_kind: "timedelta",
        parse: parse_duration,
        cast: Some(parse_duration),
    },
    FieldTypeInfo {
        kind: FieldType::Icon,
        name: "icon",
        label: "Icon",
        sql_type: "VARCHAR",
        host_kind: "char",
        parse: parse_text,
        cast: None,
    },
    FieldTypeInfo {
        kind: FieldType::Image,
        name: "image",
        label: "Image",
        sql_type: "BLOB",
        host_kind: "binary",
        parse: parse_binary,
        cast: Some(parse_binary),
    },
    FieldTypeInfo {
        kind: FieldType::Binary,
        name: "binary",
        label: "Binary",
        sql_type: "BLOB",
        host_kind: "binary",
        parse: parse_binary,
        cast: Some(parse_binary),
    },
    FieldTypeInfo {
        kind: FieldType::Reference,
        name: "reference",
        label: "Reference",
        sql_type: "VARCHAR",
        host_kind: "reference",
        parse: parse_text,
        cast: None,
    },
];

impl FieldType {
    pub fn info(self) -> &'static FieldTypeInfo {
        FIELD_TYPES
            .iter()
            .find(|t| t.kind == self)
            .expect("every field type has a catalog entry")
    }

    pub fn from_name(name: &str) -> Option<FieldType> {
        FIELD_TYPES
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .map(|t| t.kind)
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn sql_type(self) -> &'static str {
        self.info().sql_type
    }

    pub fn host_kind(self) -> &'static str {
        self.info().host_kind
    }

    /// Coerce a value into this kind. Values that cannot be represented become null.
    pub fn parse(self, value: Value) -> Value {
        (self.info().parse)(value)
    }

    /// Apply the read-time cast for values coming back from storage.
    pub fn cast(self, value: Value) -> Value {
        match self.info().cast {
            Some(cast) => cast(value),
            None => value,
        }
    }

    /// Whether data stored under `self` can be moved into a column of `other` as-is.
    pub fn compatible_with(self, other: FieldType) -> bool {
        self.host_kind() == other.host_kind()
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float | FieldType::Decimal)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldType::from_name(s).ok_or_else(|| format!("Unknown field type: {}", s))
    }
}

fn parse_text(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Text(s) => Value::Text(s),
        Value::Binary(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
        other => Value::Text(other.to_string()),
    }
}

fn parse_integer(value: Value) -> Value {
    value.as_i64().map(Value::Integer).unwrap_or(Value::Null)
}

fn parse_float(value: Value) -> Value {
    match value.as_f64() {
        Some(n) if n.is_finite() => Value::Float(n),
        _ => Value::Null,
    }
}

fn parse_boolean(value: Value) -> Value {
    match value {
        Value::Boolean(b) => Value::Boolean(b),
        Value::Integer(n) => Value::Boolean(n != 0),
        Value::Float(n) => Value::Boolean(n != 0.0),
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "y" | "yes" => Value::Boolean(true),
            "" | "0" | "f" | "false" | "n" | "no" => Value::Boolean(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn parse_date(value: Value) -> Value {
    match value {
        Value::Date(d) => Value::Date(d),
        Value::DateTime(dt) => Value::Date(dt.date()),
        Value::Text(s) => {
            let s = s.trim();
            s.get(..10)
                .and_then(|head| NaiveDate::parse_from_str(head, DATE_FORMAT).ok())
                .map(Value::Date)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn parse_datetime(value: Value) -> Value {
    match value {
        Value::DateTime(dt) => Value::DateTime(dt),
        Value::Date(d) => Value::DateTime(d.and_time(NaiveTime::MIN)),
        Value::Text(s) => parse_datetime_text(s.trim())
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub(crate) fn parse_datetime_text(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn parse_time(value: Value) -> Value {
    match value {
        Value::Time(t) => Value::Time(t),
        Value::DateTime(dt) => Value::Time(dt.time()),
        Value::Text(s) => NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
            .map(Value::Time)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn parse_duration(value: Value) -> Value {
    match value {
        Value::Duration(d) => Value::Duration(d),
        other => match other.as_f64() {
            Some(secs) if secs.is_finite() => TimeDelta::try_milliseconds((secs * 1000.0).round() as i64)
                .map(Value::Duration)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
    }
}

fn parse_binary(value: Value) -> Value {
    match value {
        Value::Binary(b) => Value::Binary(b),
        Value::Text(s) => Value::Binary(s.into_bytes()),
        _ => Value::Null,
    }
}
