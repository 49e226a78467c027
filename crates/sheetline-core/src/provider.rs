//! In-memory model provider.
//!
//! Backs model datasets and `MODEL_LOOKUP` when the host has no model layer
//! of its own, and loads from a JSON document:
//!
//! ```json
//! {"product": {"fields": [{"name": "qty", "kind": "integer"}],
//!              "records": [{"qty": 3}, {"qty": 5}]}}
//! ```

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::HashMap;

use sheetline_engine::Value;

use crate::dataset::{ModelField, ModelProvider, ModelQuery};
use crate::error::BoxError;
use crate::filter::{compare_values, json_to_value};

#[derive(Default)]
struct Model {
    fields: Vec<ModelField>,
    /// Records in id order; ids start at 1.
    records: Vec<HashMap<String, Value>>,
}

#[derive(Default)]
pub struct MemoryProvider {
    models: DashMap<String, Model>,
}

#[derive(Deserialize)]
struct ModelDocument {
    fields: Vec<ModelField>,
    #[serde(default)]
    records: Vec<serde_json::Map<String, Json>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let document: HashMap<String, ModelDocument> = serde_json::from_str(text)?;
        let provider = MemoryProvider::new();
        for (name, model) in document {
            provider.define(&name, model.fields);
            for record in model.records {
                provider.insert(
                    &name,
                    record
                        .iter()
                        .map(|(k, v)| (k.clone(), json_to_value(v)))
                        .collect(),
                );
            }
        }
        Ok(provider)
    }

    /// Declare a model, replacing any previous definition.
    pub fn define(&self, model: &str, fields: Vec<ModelField>) {
        self.models.insert(
            model.to_string(),
            Model {
                fields,
                records: Vec::new(),
            },
        );
    }

    /// Append a record and return its id.
    pub fn insert(&self, model: &str, mut record: HashMap<String, Value>) -> i64 {
        let mut entry = self.models.entry(model.to_string()).or_default();
        let id = entry.records.len() as i64 + 1;
        record.insert("id".to_string(), Value::Integer(id));
        entry.records.push(record);
        id
    }
}

fn unknown_model(model: &str) -> BoxError {
    format!("Unknown model: {}", model).into()
}

impl ModelProvider for MemoryProvider {
    fn fields(&self, model: &str) -> Result<Vec<ModelField>, BoxError> {
        let entry = self.models.get(model).ok_or_else(|| unknown_model(model))?;
        Ok(entry.fields.clone())
    }

    fn search(&self, model: &str, query: &ModelQuery<'_>) -> Result<Vec<i64>, BoxError> {
        let entry = self.models.get(model).ok_or_else(|| unknown_model(model))?;
        let mut matching: Vec<&HashMap<String, Value>> = entry
            .records
            .iter()
            .filter(|r| query.filter.matches(&|field: &str| r.get(field).cloned()))
            .collect();

        matching.sort_by(|a, b| {
            for term in query.order {
                let left = a.get(&term.field).unwrap_or(&Value::Null);
                let right = b.get(&term.field).unwrap_or(&Value::Null);
                let ordering = match (left, right) {
                    (Value::Null, Value::Null) => std::cmp::Ordering::Equal,
                    (Value::Null, _) => std::cmp::Ordering::Less,
                    (_, Value::Null) => std::cmp::Ordering::Greater,
                    _ => compare_values(left, right).unwrap_or(std::cmp::Ordering::Equal),
                };
                let ordering = if term.descending { ordering.reverse() } else { ordering };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        Ok(matching
            .into_iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[String],
    ) -> Result<Vec<HashMap<String, Value>>, BoxError> {
        let entry = self.models.get(model).ok_or_else(|| unknown_model(model))?;
        ids.iter()
            .map(|id| {
                let record = usize::try_from(*id - 1)
                    .ok()
                    .and_then(|i| entry.records.get(i))
                    .ok_or_else(|| -> BoxError { format!("{}: no record {}", model, id).into() })?;
                Ok(fields
                    .iter()
                    .map(|f| (f.clone(), record.get(f).cloned().unwrap_or_default()))
                    .collect())
            })
            .collect()
    }
}
