//! Data reachable from lookup builtins.
//!
//! `SHEET_LOOKUP` reads rows of other sheets from a [`LookupCache`] that the
//! host fills before evaluation (DashMap is internally Arc-based, clones are
//! cheap and share contents with the registered builtins).
//! `MODEL_LOOKUP` goes through a [`ModelReader`] supplied by the host.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Value;

/// Materialized rows of one sheet, keyed by column alias.
pub type SheetRows = Arc<Vec<HashMap<String, Value>>>;

#[derive(Clone, Default)]
pub struct LookupCache {
    sheets: Arc<DashMap<String, SheetRows>>,
}

impl LookupCache {
    pub fn insert_sheet(&self, alias: &str, rows: Vec<HashMap<String, Value>>) {
        self.sheets.insert(alias.to_lowercase(), Arc::new(rows));
    }

    pub fn contains_sheet(&self, alias: &str) -> bool {
        self.sheets.contains_key(&alias.to_lowercase())
    }

    pub fn clear(&self) {
        self.sheets.clear();
    }

    /// Value of `column` in the first row of `sheet` whose `key_column` equals `key`.
    pub fn find(&self, sheet: &str, key_column: &str, key: &Value, column: &str) -> Value {
        let Some(rows) = self.sheets.get(&sheet.to_lowercase()).map(|r| r.clone()) else {
            return Value::Null;
        };
        let key_column = key_column.to_lowercase();
        let column = column.to_lowercase();
        rows.iter()
            .find(|row| row.get(&key_column).is_some_and(|v| values_match(v, key)))
            .and_then(|row| row.get(&column).cloned())
            .unwrap_or(Value::Null)
    }
}

/// Loose equality used for lookup keys: numbers compare numerically, text exactly.
fn values_match(stored: &Value, key: &Value) -> bool {
    match (stored, key) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Text(a), Value::Text(b)) => a == b,
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.to_string() == b.to_string(),
        },
    }
}

/// Read access to records of external models.
pub trait ModelReader: Send + Sync {
    /// Value of `field` on record `id` of `model`, or `None` when either does not exist.
    fn read_field(&self, model: &str, id: i64, field: &str) -> Option<Value>;
}
