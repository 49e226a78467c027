//! Row values handed to the evaluator, and their conversion to Rhai values.

use rhai::{Dynamic, Map};

use crate::types::{DATE_FORMAT, DATETIME_FORMAT, TIME_FORMAT, Value, duration_seconds};

/// Column values of one row, in the order they were computed.
///
/// Keys are lower-cased aliases. Inserting an existing alias replaces its value
/// in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowValues {
    entries: Vec<(String, Value)>,
}

impl RowValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RowValues {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, alias: &str, value: Value) {
        let alias = alias.to_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == alias) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((alias, value)),
        }
    }

    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(alias))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn to_map(&self) -> Map {
        let mut map = Map::new();
        for (alias, value) in &self.entries {
            map.insert(alias.as_str().into(), value_to_dynamic(value));
        }
        map
    }
}

impl FromIterator<(String, Value)> for RowValues {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = RowValues::new();
        for (alias, value) in iter {
            row.insert(&alias, value);
        }
        row
    }
}

/// Convert a value for use inside a formula.
///
/// Temporal values become ISO strings, which is what the date builtins read.
pub fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Boolean(b) => Dynamic::from(*b),
        Value::Integer(n) => Dynamic::from(*n),
        Value::Float(n) => Dynamic::from(*n),
        Value::Text(s) => Dynamic::from(s.clone()),
        Value::Date(d) => Dynamic::from(d.format(DATE_FORMAT).to_string()),
        Value::DateTime(d) => Dynamic::from(d.format(DATETIME_FORMAT).to_string()),
        Value::Time(t) => Dynamic::from(t.format(TIME_FORMAT).to_string()),
        Value::Duration(d) => Dynamic::from(duration_seconds(d)),
        Value::Binary(b) => Dynamic::from_blob(b.clone()),
    }
}

/// Convert a formula result back into a value.
///
/// Non-finite floats (division by zero, overflow) become null.
pub fn dynamic_to_value(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Boolean(b);
    }
    if let Ok(n) = value.as_int() {
        return Value::Integer(n);
    }
    if let Ok(n) = value.as_float() {
        return if n.is_finite() { Value::Float(n) } else { Value::Null };
    }
    if let Ok(c) = value.as_char() {
        return Value::Text(c.to_string());
    }
    if value.is_string() {
        return value.into_string().map(Value::Text).unwrap_or(Value::Null);
    }
    if value.is::<rhai::Blob>() {
        return value
            .try_cast::<rhai::Blob>()
            .map(Value::Binary)
            .unwrap_or(Value::Null);
    }
    Value::Text(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_insert_replaces_in_place() {
        let mut row = RowValues::new();
        row.insert("A", Value::Integer(1));
        row.insert("b", Value::Integer(2));
        row.insert("a", Value::Integer(3));
        let keys: Vec<_> = row.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(row.get("A"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_dates_become_iso_text() {
        let d = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        let dynamic = value_to_dynamic(&Value::Date(d));
        assert_eq!(dynamic.into_string().unwrap(), "2023-12-31");
    }

    #[test]
    fn test_non_finite_results_become_null() {
        assert_eq!(dynamic_to_value(Dynamic::from(f64::NAN)), Value::Null);
        assert_eq!(dynamic_to_value(Dynamic::from(f64::INFINITY)), Value::Null);
        assert_eq!(dynamic_to_value(Dynamic::UNIT), Value::Null);
    }

    #[test]
    fn test_scalars_round_trip() {
        for v in [
            Value::Boolean(true),
            Value::Integer(-4),
            Value::Float(2.5),
            Value::Text("hi".to_string()),
            Value::Binary(vec![1, 2]),
        ] {
            assert_eq!(dynamic_to_value(value_to_dynamic(&v)), v);
        }
    }
}
