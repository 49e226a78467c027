//! Dataset abstraction: one interface over model queries, other sheets and
//! raw SQL.
//!
//! Every source answers [`Datasets::get_fields`] with the shape of its data
//! and [`Datasets::get_data`] with a lazy sequence of record batches. Model
//! sources are paged; sheet and SQL sources produce a single batch.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;

use sheetline_engine::engine::{ModelReader, RowValues, convert_to_symbol, is_valid_symbol};
use sheetline_engine::{FieldType, Value};

use crate::error::{BoxError, Result, SheetlineError};
use crate::filter::{Filter, OrderBy, order_from_json, order_to_json};
use crate::schema::SchemaRegistry;
use crate::sheet::load_sheet;
use crate::sql::{from_sql, infer_type};

/// Shape of one dataset column.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub alias: String,
    pub field_type: Option<FieldType>,
    pub link_target: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DatasetSource {
    Model {
        model: String,
        domain: Filter,
        context: Json,
        order: Vec<OrderBy>,
    },
    Sheet {
        sheet_id: i64,
    },
    Sql {
        query: String,
    },
}

impl DatasetSource {
    pub fn kind(&self) -> &'static str {
        match self {
            DatasetSource::Model { .. } => "model",
            DatasetSource::Sheet { .. } => "sheet",
            DatasetSource::Sql { .. } => "sql",
        }
    }

    /// Model source with the filter, context and order given as JSON text.
    pub fn model(model: &str, domain: &str, context: &str, order: &str) -> Result<Self> {
        let context: Json = if context.trim().is_empty() {
            Json::Object(Default::default())
        } else {
            serde_json::from_str(context).map_err(|e| SheetlineError::InvalidFilter(e.to_string()))?
        };
        if !context.is_object() {
            return Err(SheetlineError::InvalidFilter(format!(
                "context must be an object, got {}",
                context
            )));
        }
        Ok(DatasetSource::Model {
            model: model.to_string(),
            domain: Filter::parse(domain)?,
            context,
            order: crate::filter::parse_order(order)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub source: DatasetSource,
}

pub fn insert_dataset(conn: &Connection, name: &str, source: &DatasetSource) -> Result<Dataset> {
    let (model, domain, context, ordering, sheet_id, query) = match source {
        DatasetSource::Model {
            model,
            domain,
            context,
            order,
        } => (
            Some(model.clone()),
            Some(domain.to_json().to_string()),
            Some(context.to_string()),
            Some(order_to_json(order).to_string()),
            None,
            None,
        ),
        DatasetSource::Sheet { sheet_id } => (None, None, None, None, Some(*sheet_id), None),
        DatasetSource::Sql { query } => (None, None, None, None, None, Some(query.clone())),
    };
    conn.execute(
        "INSERT INTO sheetline_dataset (name, source, model, domain, context, ordering, sheet_id, query)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![name, source.kind(), model, domain, context, ordering, sheet_id, query],
    )?;
    Ok(Dataset {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        source: source.clone(),
    })
}

pub fn load_dataset(conn: &Connection, id: i64) -> Result<Dataset> {
    type RawDataset = (
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<i64>,
        Option<String>,
    );
    let raw: Option<RawDataset> = conn
        .query_row(
            "SELECT name, source, model, domain, context, ordering, sheet_id, query
             FROM sheetline_dataset WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()?;
    let Some((name, kind, model, domain, context, ordering, sheet_id, query)) = raw else {
        return Err(SheetlineError::UnknownDataset(id));
    };

    let source = match kind.as_str() {
        "model" => DatasetSource::Model {
            model: model.unwrap_or_default(),
            domain: Filter::parse(domain.as_deref().unwrap_or(""))?,
            context: match context.as_deref() {
                Some(text) if !text.trim().is_empty() => serde_json::from_str(text)?,
                _ => Json::Object(Default::default()),
            },
            order: match ordering.as_deref() {
                Some(text) if !text.trim().is_empty() => order_from_json(&serde_json::from_str(text)?)?,
                _ => Vec::new(),
            },
        },
        // Sheet sources whose sheet was deleted read as empty.
        "sheet" => DatasetSource::Sheet {
            sheet_id: sheet_id.unwrap_or_default(),
        },
        _ => DatasetSource::Sql {
            query: query.unwrap_or_default(),
        },
    };
    Ok(Dataset { id, name, source })
}

/// Alias a dataset column goes by in a sheet.
pub fn field_alias(column: &str) -> String {
    if is_valid_symbol(column) {
        column.to_string()
    } else {
        convert_to_symbol(column)
    }
}

/// One input record. Columns are shared by every record of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Record { columns, values }
    }

    /// Field access by column name, or by the alias derived from it
    /// (`Unit Price` answers to `unit_price`). `None` when the source has
    /// no such field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| field_alias(c) == name))
            .and_then(|i| self.values.get(i))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn to_row(&self) -> RowValues {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// A field of an external model.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ModelField {
    pub name: String,
    #[serde(default)]
    pub string: String,
    /// Host field kind (`char`, `integer`, `many2one`, ...).
    pub kind: String,
    #[serde(default)]
    pub relation: Option<String>,
}

impl ModelField {
    /// Field type for the host kind, if the type catalog has one.
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_name(&self.kind).or_else(|| {
            sheetline_engine::types::FIELD_TYPES
                .iter()
                .find(|t| t.host_kind == self.kind)
                .map(|t| t.kind)
        })
    }
}

/// Paging and filtering of a model search.
#[derive(Clone, Debug)]
pub struct ModelQuery<'a> {
    pub filter: &'a Filter,
    pub context: &'a Json,
    pub order: &'a [OrderBy],
    pub offset: usize,
    pub limit: Option<usize>,
}

/// External collaborator that owns host models.
pub trait ModelProvider: Send + Sync {
    fn fields(&self, model: &str) -> std::result::Result<Vec<ModelField>, BoxError>;

    /// Ids of matching records in order.
    fn search(&self, model: &str, query: &ModelQuery<'_>) -> std::result::Result<Vec<i64>, BoxError>;

    /// `fields` of each record in `ids`, in the same order.
    fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: &[String],
    ) -> std::result::Result<Vec<HashMap<String, Value>>, BoxError>;
}

/// Adapts a [`ModelProvider`] for `MODEL_LOOKUP`.
pub struct ProviderReader(pub Arc<dyn ModelProvider>);

impl ModelReader for ProviderReader {
    fn read_field(&self, model: &str, id: i64, field: &str) -> Option<Value> {
        match self.0.read(model, &[id], &[field.to_string()]) {
            Ok(mut records) => records.pop().and_then(|mut r| r.remove(field)),
            Err(e) => {
                tracing::trace!(model, id, field, error = %e, "model lookup failed");
                None
            }
        }
    }
}

/// Lazy batches produced by [`Datasets::get_data`].
pub struct Batches<'c> {
    state: BatchState<'c>,
}

enum BatchState<'c> {
    Paged {
        provider: Arc<dyn ModelProvider>,
        model: String,
        domain: Filter,
        context: Json,
        order: Vec<OrderBy>,
        columns: Arc<[String]>,
        offset: usize,
        page_size: usize,
    },
    Once(Box<dyn FnOnce() -> Result<Vec<Record>> + 'c>),
    Done,
}

impl<'c> Batches<'c> {
    fn once(load: impl FnOnce() -> Result<Vec<Record>> + 'c) -> Self {
        Batches {
            state: BatchState::Once(Box::new(load)),
        }
    }

    fn next_page(&mut self) -> Option<Result<Vec<Record>>> {
        let BatchState::Paged {
            provider,
            model,
            domain,
            context,
            order,
            columns,
            offset,
            page_size,
        } = &mut self.state
        else {
            return None;
        };

        let query = ModelQuery {
            filter: &*domain,
            context: &*context,
            order: order.as_slice(),
            offset: *offset,
            limit: Some(*page_size),
        };
        let page = provider.search(model, &query).and_then(|ids| {
            if ids.is_empty() {
                return Ok((ids, Vec::new()));
            }
            let records = provider.read(model, &ids, &columns[..])?;
            Ok((ids, records))
        });
        match page {
            Err(e) => {
                self.state = BatchState::Done;
                Some(Err(SheetlineError::Provider(e)))
            }
            Ok((ids, _)) if ids.is_empty() => {
                self.state = BatchState::Done;
                None
            }
            Ok((ids, mut records)) => {
                tracing::debug!(model = %model, offset = *offset, count = ids.len(), "fetched page");
                let batch = records
                    .iter_mut()
                    .map(|r| {
                        let values = columns.iter().map(|c| r.remove(c).unwrap_or_default()).collect();
                        Record::new(columns.clone(), values)
                    })
                    .collect();
                *offset += ids.len();
                if ids.len() < *page_size {
                    self.state = BatchState::Done;
                }
                Some(Ok(batch))
            }
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Vec<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, BatchState::Done) {
            BatchState::Done => None,
            BatchState::Once(load) => Some(load()),
            paged @ BatchState::Paged { .. } => {
                self.state = paged;
                self.next_page()
            }
        }
    }
}

/// Resolves datasets into field lists and record batches.
pub struct Datasets {
    registry: Arc<SchemaRegistry>,
    provider: Option<Arc<dyn ModelProvider>>,
    page_size: usize,
}

impl Datasets {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        provider: Option<Arc<dyn ModelProvider>>,
        page_size: usize,
    ) -> Self {
        Datasets {
            registry,
            provider,
            page_size: page_size.max(1),
        }
    }

    pub fn provider(&self) -> Option<&Arc<dyn ModelProvider>> {
        self.provider.as_ref()
    }

    fn require_provider(&self) -> Result<&Arc<dyn ModelProvider>> {
        self.provider.as_ref().ok_or(SheetlineError::NoModelProvider)
    }

    pub fn get_fields(&self, conn: &Connection, dataset: &Dataset) -> Result<Vec<FieldSpec>> {
        match &dataset.source {
            DatasetSource::Model { model, .. } => {
                let fields = self
                    .require_provider()?
                    .fields(model)
                    .map_err(SheetlineError::Provider)?;
                Ok(fields
                    .into_iter()
                    .filter_map(|f| {
                        let field_type = f.field_type()?;
                        Some(FieldSpec {
                            alias: f.name.clone(),
                            name: if f.string.is_empty() { f.name } else { f.string },
                            field_type: Some(field_type),
                            link_target: f.relation,
                        })
                    })
                    .collect())
            }
            DatasetSource::Sheet { sheet_id } => {
                let sheet = load_sheet(conn, *sheet_id)?;
                Ok(sheet
                    .formulas
                    .into_iter()
                    .map(|f| FieldSpec {
                        name: f.name,
                        alias: f.alias,
                        field_type: f.field_type,
                        link_target: f.link_target,
                    })
                    .collect())
            }
            DatasetSource::Sql { query } => {
                let mut stmt = conn.prepare(query)?;
                let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
                let mut rows = stmt.query([])?;
                let first = rows.next()?;
                let mut fields = Vec::with_capacity(names.len());
                for (i, name) in names.into_iter().enumerate() {
                    let field_type = match first {
                        Some(row) => infer_type(row.get_ref(i)?),
                        None => FieldType::Text,
                    };
                    fields.push(FieldSpec {
                        alias: name.clone(),
                        name,
                        field_type: Some(field_type),
                        link_target: None,
                    });
                }
                Ok(fields)
            }
        }
    }

    /// Lazy record batches. Each call starts from the beginning.
    pub fn get_data<'c>(&self, conn: &'c Connection, dataset: &Dataset) -> Result<Batches<'c>> {
        match &dataset.source {
            DatasetSource::Model {
                model,
                domain,
                context,
                order,
            } => {
                let provider = self.require_provider()?.clone();
                let columns: Arc<[String]> = provider
                    .fields(model)
                    .map_err(SheetlineError::Provider)?
                    .into_iter()
                    .filter(|f| f.field_type().is_some())
                    .map(|f| f.name)
                    .collect();
                let order = if order.is_empty() {
                    vec![OrderBy::asc("id")]
                } else {
                    order.clone()
                };
                Ok(Batches {
                    state: BatchState::Paged {
                        provider,
                        model: model.clone(),
                        domain: domain.clone(),
                        context: context.clone(),
                        order,
                        columns,
                        offset: 0,
                        page_size: self.page_size,
                    },
                })
            }
            DatasetSource::Sheet { sheet_id } => {
                let registry = self.registry.clone();
                let sheet_id = *sheet_id;
                Ok(Batches::once(move || {
                    let sheet = load_sheet(conn, sheet_id)?;
                    let Some(table_id) = sheet.current_table else {
                        return Ok(Vec::new());
                    };
                    let view = registry.schema_view(conn, table_id)?;
                    let (columns, rows) = view.scan(conn)?;
                    Ok(rows
                        .into_iter()
                        .map(|values| Record::new(columns.clone(), values))
                        .collect())
                }))
            }
            DatasetSource::Sql { query } => {
                let query = query.clone();
                Ok(Batches::once(move || {
                    let mut stmt = conn.prepare(&query)?;
                    let columns: Arc<[String]> =
                        stmt.column_names().into_iter().map(String::from).collect();
                    let width = columns.len();
                    let rows = stmt
                        .query_map([], |row| {
                            (0..width)
                                .map(|i| Ok(from_sql(row.get_ref(i)?)))
                                .collect::<rusqlite::Result<Vec<Value>>>()
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows
                        .into_iter()
                        .map(|values| Record::new(columns.clone(), values))
                        .collect())
                }))
            }
        }
    }
}
