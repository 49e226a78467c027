//! Record access against whichever table is current for a context.
//!
//! The column set is resolved per call from a [`SchemaView`]; nothing about a
//! table's shape is known statically. Writing a direct column re-derives the
//! formula columns of the affected rows.

use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use std::collections::BTreeSet;
use std::sync::Arc;

use sheetline_engine::engine::RowValues;
use sheetline_engine::{FieldType, FormulaCompiler, Value};

use crate::error::{Result, SheetlineError};
use crate::filter::{Filter, OrderBy, order_sql};
use crate::pipeline::{Derivation, preload_lookups};
use crate::schema::{AUDIT_COLUMNS, SchemaRegistry, SchemaView, TableField};
use crate::sheet::load_sheet;
use crate::sql::{MAX_PARAMS, now_timestamp, placeholders, quote_ident, read_value, to_sql};
use crate::view::{load_view, view_table};

/// Which table an operation targets, by priority: explicit table, sheet, view.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ActiveContext {
    pub table: Option<i64>,
    pub sheet: Option<i64>,
    pub view: Option<i64>,
}

impl ActiveContext {
    pub fn table(id: i64) -> Self {
        ActiveContext {
            table: Some(id),
            ..Default::default()
        }
    }

    pub fn sheet(id: i64) -> Self {
        ActiveContext {
            sheet: Some(id),
            ..Default::default()
        }
    }

    pub fn view(id: i64) -> Self {
        ActiveContext {
            view: Some(id),
            ..Default::default()
        }
    }

    /// The table bound to this context, if any.
    pub fn resolve(&self, conn: &Connection) -> Result<Option<i64>> {
        if let Some(table) = self.table {
            return Ok(Some(table));
        }
        if let Some(sheet) = self.sheet {
            return Ok(load_sheet(conn, sheet)?.current_table);
        }
        if let Some(view) = self.view {
            return view_table(conn, &load_view(conn, view)?);
        }
        Ok(None)
    }
}

/// Field metadata handed to view renderers.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub string: String,
    pub field_type: Option<FieldType>,
    /// Host field kind from the type catalog.
    pub kind: Option<&'static str>,
    pub help: Option<String>,
    pub relation: Option<String>,
    pub readonly: bool,
    pub stored: bool,
}

impl From<&TableField> for FieldDescriptor {
    fn from(field: &TableField) -> Self {
        FieldDescriptor {
            name: field.name.clone(),
            string: field.string.clone(),
            field_type: field.field_type,
            kind: field.field_type.map(|t| t.host_kind()),
            help: field.help.clone(),
            relation: field.link_target.clone(),
            readonly: field.is_derived(),
            stored: field.is_column(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ViewDescriptor {
    pub view_type: String,
    pub arch: Option<String>,
    pub fields: Vec<FieldDescriptor>,
    pub field_childs: Option<String>,
}

/// One row read back from a sheet table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableRow {
    pub id: i64,
    pub values: RowValues,
}

/// Generic CRUD over sheet tables.
pub struct RecordAccess {
    registry: Arc<SchemaRegistry>,
    compiler: Arc<FormulaCompiler>,
    user_id: i64,
}

impl RecordAccess {
    pub fn new(registry: Arc<SchemaRegistry>, compiler: Arc<FormulaCompiler>, user_id: i64) -> Self {
        RecordAccess {
            registry,
            compiler,
            user_id,
        }
    }

    fn schema(&self, conn: &Connection, ctx: &ActiveContext) -> Result<Arc<SchemaView>> {
        let table = ctx.resolve(conn)?.ok_or(SheetlineError::NoActiveTable)?;
        self.registry.schema_view(conn, table)
    }

    /// Field descriptors of the active table; empty before activation.
    pub fn fields(&self, conn: &Connection, ctx: &ActiveContext) -> Result<Vec<FieldDescriptor>> {
        match ctx.resolve(conn)? {
            None => Ok(Vec::new()),
            Some(table) => {
                let view = self.registry.schema_view(conn, table)?;
                Ok(view.fields.iter().map(FieldDescriptor::from).collect())
            }
        }
    }

    /// Stored view descriptor of the active table for `view_type`.
    pub fn view_descriptor(
        &self,
        conn: &Connection,
        ctx: &ActiveContext,
        view_type: &str,
    ) -> Result<Option<ViewDescriptor>> {
        let Some(table) = ctx.resolve(conn)? else {
            return Ok(None);
        };
        let view = self.registry.schema_view(conn, table)?;
        let Some(stored) = view.views.iter().find(|v| v.view_type == view_type) else {
            return Ok(None);
        };
        let wanted: Option<Vec<&str>> = stored
            .field_names
            .as_deref()
            .map(|names| names.split(',').map(str::trim).filter(|n| !n.is_empty()).collect());
        let fields = view
            .fields
            .iter()
            .filter(|f| wanted.as_ref().is_none_or(|w| w.contains(&f.name.as_str())))
            .map(FieldDescriptor::from)
            .collect();
        Ok(Some(ViewDescriptor {
            view_type: stored.view_type.clone(),
            arch: stored.arch.clone(),
            fields,
            field_childs: stored.field_childs.clone(),
        }))
    }

    /// Ids of the rows matching `filter`.
    pub fn search(
        &self,
        conn: &Connection,
        ctx: &ActiveContext,
        filter: &Filter,
        offset: usize,
        limit: Option<usize>,
        order: &[OrderBy],
    ) -> Result<Vec<i64>> {
        let view = self.schema(conn, ctx)?;
        let (condition, mut params) = filter.to_sql(|f| view.has_column(f))?;
        let order = order_sql(order, |f| view.has_column(f))?;
        let mut sql = format!(
            "SELECT \"id\" FROM {} WHERE {} ORDER BY {}",
            view.quoted_name(),
            condition,
            order
        );
        if limit.is_some() || offset > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(limit.map(|l| l as i64).unwrap_or(-1)));
            params.push(SqlValue::Integer(offset as i64));
        }
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(params), |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn count(&self, conn: &Connection, ctx: &ActiveContext) -> Result<i64> {
        let view = self.schema(conn, ctx)?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", view.quoted_name()), [], |r| {
            r.get(0)
        })?;
        Ok(count)
    }

    /// Rows by id with read-time casts applied. `field_names` defaults to every
    /// stored column; `id` and audit columns may be requested too.
    pub fn read(
        &self,
        conn: &Connection,
        ctx: &ActiveContext,
        ids: &[i64],
        field_names: Option<&[String]>,
    ) -> Result<Vec<TableRow>> {
        let view = self.schema(conn, ctx)?;
        read_rows(conn, &view, ids, field_names)
    }

    /// Insert rows and derive their formula columns. Returns the new ids.
    pub fn create(&self, conn: &Connection, ctx: &ActiveContext, rows: &[RowValues]) -> Result<Vec<i64>> {
        let view = self.schema(conn, ctx)?;
        if view.singleton {
            let existing: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", view.quoted_name()), [], |r| r.get(0))?;
            if existing as usize + rows.len() > 1 {
                return Err(SheetlineError::SingletonFull(view.table_name.clone()));
            }
        }

        let now = now_timestamp();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let mut columns = Vec::with_capacity(row.len() + AUDIT_COLUMNS.len());
            let mut params = Vec::with_capacity(row.len() + AUDIT_COLUMNS.len());
            for (name, value) in row.iter() {
                let field = writable_column(&view, name)?;
                columns.push(quote_ident(&field.name));
                params.push(to_sql(&coerce_input(field, value)));
            }
            for (column, value) in AUDIT_COLUMNS.iter().zip(audit_values(self.user_id, &now)) {
                columns.push(quote_ident(column));
                params.push(value);
            }
            conn.execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    view.quoted_name(),
                    columns.join(", "),
                    placeholders(params.len())
                ),
                rusqlite::params_from_iter(params),
            )?;
            ids.push(conn.last_insert_rowid());
        }

        if view.has_derived_columns() {
            self.derive(conn, &view, Some(&ids))?;
        }
        Ok(ids)
    }

    /// Apply each `(ids, values)` group. Groups that only touch direct
    /// columns re-derive the formula columns of their rows.
    pub fn write(
        &self,
        conn: &Connection,
        ctx: &ActiveContext,
        groups: &[(Vec<i64>, RowValues)],
    ) -> Result<()> {
        let view = self.schema(conn, ctx)?;
        let derived: BTreeSet<&str> = view.derived().map(|f| f.name.as_str()).collect();
        let mut rederive = Vec::new();
        for (ids, values) in groups {
            self.update(conn, &view, ids, values)?;
            let touches_derived = values.iter().any(|(name, _)| derived.contains(name));
            if !touches_derived && view.has_derived_columns() {
                rederive.extend_from_slice(ids);
            }
        }
        if !rederive.is_empty() {
            self.derive(conn, &view, Some(&rederive))?;
        }
        Ok(())
    }

    /// Delete rows by id; unsaved (non-positive) ids are skipped.
    pub fn delete(&self, conn: &Connection, ctx: &ActiveContext, ids: &[i64]) -> Result<usize> {
        let view = self.schema(conn, ctx)?;
        let ids: Vec<i64> = ids.iter().copied().filter(|id| *id > 0).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0;
        for chunk in ids.chunks(MAX_PARAMS) {
            deleted += conn.execute(
                &format!(
                    "DELETE FROM {} WHERE \"id\" IN ({})",
                    view.quoted_name(),
                    placeholders(chunk.len())
                ),
                rusqlite::params_from_iter(chunk),
            )?;
        }
        Ok(deleted)
    }

    /// Duplicate rows (without id and audit columns). Returns the new ids.
    pub fn copy(&self, conn: &Connection, ctx: &ActiveContext, ids: &[i64]) -> Result<Vec<i64>> {
        let view = self.schema(conn, ctx)?;
        let rows: Vec<RowValues> = read_rows(conn, &view, ids, None)?
            .into_iter()
            .map(|row| row.values)
            .collect();
        self.create(conn, ctx, &rows)
    }

    /// Re-evaluate formula columns for `ids`, or for every row when `None`.
    /// Returns the number of rows rewritten.
    pub fn update_formulas(&self, conn: &Connection, ctx: &ActiveContext, ids: Option<&[i64]>) -> Result<usize> {
        let view = self.schema(conn, ctx)?;
        self.derive(conn, &view, ids)
    }

    fn derive(&self, conn: &Connection, view: &SchemaView, ids: Option<&[i64]>) -> Result<usize> {
        let derivation = Derivation::compile(&self.compiler, &view.fields)?;
        let stored: Vec<&str> = view
            .columns()
            .filter(|f| f.is_derived())
            .map(|f| f.name.as_str())
            .collect();
        if derivation.is_empty() || stored.is_empty() {
            return Ok(0);
        }
        preload_lookups(conn, &self.registry, &self.compiler, &derivation.sheet_lookups())?;

        let all_ids;
        let ids = match ids {
            Some(ids) => ids,
            None => {
                all_ids = self.all_ids(conn, view)?;
                &all_ids
            }
        };
        let direct: Vec<String> = view
            .columns()
            .filter(|f| !f.is_derived())
            .map(|f| f.name.clone())
            .collect();

        let rows = read_rows(conn, view, ids, Some(&direct))?;
        for row in &rows {
            let mut values = row.values.clone();
            derivation.apply(&self.compiler, &mut values);
            // Only derived columns go back, so this never re-triggers derivation.
            let payload: RowValues = stored
                .iter()
                .map(|name| (name.to_string(), values.get(name).cloned().unwrap_or_default()))
                .collect();
            self.update(conn, view, &[row.id], &payload)?;
        }
        tracing::debug!(table = %view.table_name, rows = rows.len(), "updated formulas");
        Ok(rows.len())
    }

    fn all_ids(&self, conn: &Connection, view: &SchemaView) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(&format!("SELECT \"id\" FROM {} ORDER BY \"id\"", view.quoted_name()))?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Plain `UPDATE` of `values` plus write stamps.
    fn update(&self, conn: &Connection, view: &SchemaView, ids: &[i64], values: &RowValues) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut assignments = Vec::with_capacity(values.len() + 2);
        let mut values_params = Vec::with_capacity(values.len() + 2);
        for (name, value) in values.iter() {
            let field = writable_column(view, name)?;
            assignments.push(format!("{} = ?", quote_ident(&field.name)));
            values_params.push(to_sql(&coerce_input(field, value)));
        }
        assignments.push("\"write_uid\" = ?".to_string());
        values_params.push(SqlValue::Integer(self.user_id));
        assignments.push("\"write_date\" = ?".to_string());
        values_params.push(SqlValue::Text(now_timestamp()));

        let per_statement = MAX_PARAMS.saturating_sub(values_params.len()).max(1);
        for chunk in ids.chunks(per_statement) {
            let params = values_params
                .iter()
                .cloned()
                .chain(chunk.iter().map(|id| SqlValue::Integer(*id)));
            let sql = format!(
                "UPDATE {} SET {} WHERE \"id\" IN ({})",
                view.quoted_name(),
                assignments.join(", "),
                placeholders(chunk.len())
            );
            conn.prepare_cached(&sql)?.execute(rusqlite::params_from_iter(params))?;
        }
        Ok(())
    }
}

fn audit_values(user_id: i64, now: &str) -> [SqlValue; 4] {
    [
        SqlValue::Integer(user_id),
        SqlValue::Integer(user_id),
        SqlValue::Text(now.to_string()),
        SqlValue::Text(now.to_string()),
    ]
}

fn writable_column<'v>(view: &'v SchemaView, name: &str) -> Result<&'v TableField> {
    view.column(&name.to_lowercase())
        .ok_or_else(|| SheetlineError::UnknownField(name.to_string()))
}

fn coerce_input(field: &TableField, value: &Value) -> Value {
    match field.field_type {
        Some(t) => t.parse(value.clone()),
        None => value.clone(),
    }
}

fn read_rows(
    conn: &Connection,
    view: &SchemaView,
    ids: &[i64],
    field_names: Option<&[String]>,
) -> Result<Vec<TableRow>> {
    let names: Vec<String> = match field_names {
        Some(names) => names.to_vec(),
        None => view.column_names(),
    };
    let types = names
        .iter()
        .map(|name| match name.as_str() {
            "id" | "create_uid" | "write_uid" => Ok(Some(FieldType::Integer)),
            "create_date" | "write_date" => Ok(Some(FieldType::Timestamp)),
            other => view
                .column(other)
                .map(|f| f.field_type)
                .ok_or_else(|| SheetlineError::UnknownField(other.to_string())),
        })
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    // Sorted so that chunked reads still come back in id order.
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let projection = std::iter::once("\"id\"".to_string())
        .chain(names.iter().map(|n| quote_ident(n)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut rows = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_PARAMS) {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE \"id\" IN ({}) ORDER BY \"id\"",
            projection,
            view.quoted_name(),
            placeholders(chunk.len())
        ))?;
        let found = stmt.query_map(rusqlite::params_from_iter(chunk), |r| {
            let mut values = RowValues::with_capacity(names.len());
            for (i, (name, field_type)) in names.iter().zip(&types).enumerate() {
                values.insert(name, read_value(r.get_ref(i + 1)?, *field_type));
            }
            Ok(TableRow {
                id: r.get(0)?,
                values,
            })
        })?;
        for row in found {
            rows.push(row?);
        }
    }
    Ok(rows)
}
