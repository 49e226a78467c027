//! Schema registry: physical tables whose columns are decided at runtime.
//!
//! Every sheet revision gets its own table. The registry keeps the metadata
//! (`sheetline_table`, `sheetline_table_field`, `sheetline_table_view`) and the
//! physical table in step, migrates rows between revisions, and reaps tables
//! that no sheet uses any more.
//!
//! Column sets are resolved into a [`SchemaView`] per table and cached by
//! table id. Tables are immutable once created, so the cache never goes stale
//! except when a table is deleted.

use chrono::NaiveDateTime;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::sync::Arc;

use sheetline_engine::{FieldType, Value};

use crate::error::{Result, SheetlineError};
use crate::sql::{TIMESTAMP_FORMAT, now_timestamp, quote_ident, read_value};

/// Columns every physical table carries besides `id`.
pub const AUDIT_COLUMNS: [&str; 4] = ["create_uid", "write_uid", "create_date", "write_date"];

/// Whether `name` is a column every table has regardless of its fields.
pub fn is_system_column(name: &str) -> bool {
    name == "id" || AUDIT_COLUMNS.contains(&name)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableField {
    /// Column name (a formula alias).
    pub name: String,
    /// Display label.
    pub string: String,
    pub field_type: Option<FieldType>,
    pub help: Option<String>,
    pub link_target: Option<String>,
    /// Expression the column is derived from, if any.
    pub formula: Option<String>,
    pub store: bool,
}

impl TableField {
    pub fn new(name: &str, string: &str, field_type: FieldType) -> Self {
        TableField {
            name: name.to_string(),
            string: string.to_string(),
            field_type: Some(field_type),
            help: None,
            link_target: None,
            formula: None,
            store: true,
        }
    }

    /// Whether the field has a physical column.
    pub fn is_column(&self) -> bool {
        self.store && self.field_type.is_some()
    }

    /// Whether the field is recomputed from an expression.
    pub fn is_derived(&self) -> bool {
        self.formula.as_deref().is_some_and(|f| !f.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableView {
    pub view_type: String,
    pub arch: Option<String>,
    pub system: bool,
    pub field_names: Option<String>,
    pub field_childs: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub id: i64,
    pub name: String,
    pub singleton: bool,
    pub create_date: String,
    pub fields: Vec<TableField>,
    pub views: Vec<TableView>,
}

/// Definition of a table to provision.
#[derive(Clone, Debug, Default)]
pub struct NewTable {
    pub name: String,
    pub singleton: bool,
    pub fields: Vec<TableField>,
    pub views: Vec<TableView>,
}

/// Resolved column set of one table.
#[derive(Clone, Debug)]
pub struct SchemaView {
    pub table_id: i64,
    pub table_name: String,
    pub singleton: bool,
    /// Every field in declaration order, including ones without a column.
    pub fields: Vec<TableField>,
    pub views: Vec<TableView>,
}

impl SchemaView {
    fn from_table(table: Table) -> Self {
        SchemaView {
            table_id: table.id,
            table_name: table.name,
            singleton: table.singleton,
            fields: table.fields,
            views: table.views,
        }
    }

    /// Fields backed by a physical column, in order.
    pub fn columns(&self) -> impl Iterator<Item = &TableField> {
        self.fields.iter().filter(|f| f.is_column())
    }

    pub fn column(&self, name: &str) -> Option<&TableField> {
        self.columns().find(|f| f.name == name)
    }

    /// Whether `name` can appear in a query against this table.
    pub fn has_column(&self, name: &str) -> bool {
        is_system_column(name) || self.column(name).is_some()
    }

    /// Fields recomputed from expressions, stored or not, in order.
    pub fn derived(&self) -> impl Iterator<Item = &TableField> {
        self.fields.iter().filter(|f| f.is_derived())
    }

    pub fn has_derived_columns(&self) -> bool {
        self.columns().any(|f| f.is_derived())
    }

    pub fn quoted_name(&self) -> String {
        quote_ident(&self.table_name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns().map(|f| f.name.clone()).collect()
    }

    /// Read every row's stored columns with their read-time casts, by id.
    pub fn scan(&self, conn: &Connection) -> Result<(Arc<[String]>, Vec<Vec<Value>>)> {
        let fields: Vec<&TableField> = self.columns().collect();
        let names: Arc<[String]> = fields.iter().map(|f| f.name.clone()).collect();
        if fields.is_empty() {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.quoted_name()), [], |r| r.get(0))?;
            return Ok((names, vec![Vec::new(); count as usize]));
        }

        let projection = fields
            .iter()
            .map(|f| quote_ident(&f.name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY \"id\"",
            projection,
            self.quoted_name()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| Ok(read_value(row.get_ref(i)?, f.field_type)))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((names, rows))
    }
}

/// Outcome of migrating rows between two revisions of a table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Columns whose data was copied.
    pub copied: Vec<String>,
    /// Source columns with no counterpart in the destination.
    pub lost: Vec<String>,
    /// Columns present in both with incompatible types, as `name (from -> to)`.
    pub changed: Vec<String>,
    /// Destination columns with no source data.
    pub missing: Vec<String>,
    pub rows: usize,
}

impl CopyReport {
    pub fn has_losses(&self) -> bool {
        !self.lost.is_empty() || !self.changed.is_empty()
    }

    /// Human-readable list of the data that will not survive the migration.
    pub fn loss_message(&self, from: &str, to: &str) -> String {
        let lines: Vec<String> = self
            .lost
            .iter()
            .chain(self.changed.iter())
            .map(|c| format!("- {}", c))
            .collect();
        format!(
            "Copying data from \"{}\" to \"{}\" will lose these columns:\n{}",
            from,
            to,
            lines.join("\n")
        )
    }
}

fn type_name(t: Option<FieldType>) -> &'static str {
    t.map(|t| t.name()).unwrap_or("none")
}

/// Compare two column sets. Names are matched exactly; types must share a host kind.
pub fn plan_copy(source: &[TableField], destination: &[TableField]) -> CopyReport {
    let src: BTreeMap<&str, Option<FieldType>> = source
        .iter()
        .filter(|f| f.is_column())
        .map(|f| (f.name.as_str(), f.field_type))
        .collect();
    let dst: BTreeMap<&str, Option<FieldType>> = destination
        .iter()
        .filter(|f| f.is_column())
        .map(|f| (f.name.as_str(), f.field_type))
        .collect();

    let mut report = CopyReport::default();
    for (name, from) in &src {
        match dst.get(name) {
            None => report.lost.push(name.to_string()),
            Some(to) => {
                let compatible = match (from, to) {
                    (Some(a), Some(b)) => a.compatible_with(*b),
                    _ => false,
                };
                if compatible {
                    report.copied.push(name.to_string());
                } else {
                    report
                        .changed
                        .push(format!("{} ({} -> {})", name, type_name(*from), type_name(*to)));
                }
            }
        }
    }
    report.missing = dst
        .keys()
        .filter(|name| !src.contains_key(*name))
        .map(|name| name.to_string())
        .collect();
    report
}

/// Provisions, migrates and retires physical tables.
#[derive(Default)]
pub struct SchemaRegistry {
    views: DashMap<i64, Arc<SchemaView>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new table and provision its physical storage.
    pub fn register(&self, conn: &Connection, new: &NewTable) -> Result<Table> {
        let create_date = now_timestamp();
        conn.execute(
            "INSERT INTO sheetline_table (name, singleton, create_date) VALUES (?1, ?2, ?3)",
            params![new.name, new.singleton, create_date],
        )?;
        let id = conn.last_insert_rowid();

        for (sequence, field) in new.fields.iter().enumerate() {
            conn.execute(
                "INSERT INTO sheetline_table_field
                   (table_id, sequence, name, string, type, help, link_target, formula, store)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    sequence as i64,
                    field.name,
                    field.string,
                    field.field_type.map(|t| t.name()),
                    field.help,
                    field.link_target,
                    field.formula,
                    field.store,
                ],
            )?;
        }
        for view in &new.views {
            conn.execute(
                "INSERT INTO sheetline_table_view
                   (table_id, view_type, arch, system, field_names, field_childs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    view.view_type,
                    view.arch,
                    view.system,
                    view.field_names,
                    view.field_childs,
                ],
            )?;
        }

        let table = Table {
            id,
            name: new.name.clone(),
            singleton: new.singleton,
            create_date,
            fields: new.fields.clone(),
            views: new.views.clone(),
        };
        self.create_table(conn, &table)?;
        Ok(table)
    }

    /// Provision the physical table, replacing any table with the same name.
    pub fn create_table(&self, conn: &Connection, table: &Table) -> Result<()> {
        let name = quote_ident(&table.name);
        let mut columns = vec![
            "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            "\"create_uid\" INTEGER NOT NULL DEFAULT 0".to_string(),
            "\"write_uid\" INTEGER NOT NULL DEFAULT 0".to_string(),
            "\"create_date\" TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string(),
            "\"write_date\" TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string(),
        ];
        for field in table.fields.iter().filter(|f| f.is_column()) {
            let sql_type = field.field_type.map(|t| t.sql_type()).unwrap_or("VARCHAR");
            columns.push(format!("{} {}", quote_ident(&field.name), sql_type));
        }

        if table_exists(conn, &table.name)? {
            tracing::debug!(table = %table.name, "replacing existing table");
            conn.execute_batch(&format!("DROP TABLE {};", name))?;
        }
        conn.execute_batch(&format!("CREATE TABLE {} (\n  {}\n);", name, columns.join(",\n  ")))?;
        tracing::debug!(table = %table.name, columns = columns.len(), "created table");
        Ok(())
    }

    /// Drop the physical table and release its id sequence.
    ///
    /// Refuses when a sheet still uses the table.
    pub fn drop_table(&self, conn: &Connection, table: &Table) -> Result<()> {
        if is_current(conn, table.id)? {
            return Err(SheetlineError::TableInUse(table.id));
        }
        drop_physical(conn, &table.name)?;
        self.views.remove(&table.id);
        Ok(())
    }

    /// Copy rows from `source` into `destination` over the compatible columns.
    ///
    /// Never fails because of lost columns; the report says what was lost.
    pub fn copy_from(
        &self,
        conn: &Connection,
        destination: &Table,
        source: &Table,
    ) -> Result<CopyReport> {
        let mut report = plan_copy(&source.fields, &destination.fields);
        if report.has_losses() {
            tracing::warn!(
                from = %source.name,
                to = %destination.name,
                lost = ?report.lost,
                changed = ?report.changed,
                "migration drops columns"
            );
        }
        if report.copied.is_empty() {
            return Ok(report);
        }

        let columns = report
            .copied
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({cols}) SELECT {cols} FROM {} ORDER BY \"id\"",
            quote_ident(&destination.name),
            quote_ident(&source.name),
            cols = columns,
        );
        report.rows = conn.execute(&sql, [])?;
        Ok(report)
    }

    pub fn count(&self, conn: &Connection, table: &Table) -> Result<i64> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&table.name)),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn table(&self, conn: &Connection, id: i64) -> Result<Table> {
        let header = conn
            .query_row(
                "SELECT name, singleton, create_date FROM sheetline_table WHERE id = ?1",
                params![id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, bool>(1)?, r.get::<_, String>(2)?)),
            )
            .optional()?;
        let Some((name, singleton, create_date)) = header else {
            return Err(SheetlineError::UnknownTable(id));
        };

        let mut stmt = conn.prepare(
            "SELECT name, string, type, help, link_target, formula, store
             FROM sheetline_table_field WHERE table_id = ?1 ORDER BY sequence, id",
        )?;
        let fields = stmt
            .query_map(params![id], |r| {
                let kind: Option<String> = r.get(2)?;
                Ok(TableField {
                    name: r.get(0)?,
                    string: r.get(1)?,
                    field_type: kind.as_deref().and_then(FieldType::from_name),
                    help: r.get(3)?,
                    link_target: r.get(4)?,
                    formula: r.get(5)?,
                    store: r.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT view_type, arch, system, field_names, field_childs
             FROM sheetline_table_view WHERE table_id = ?1 ORDER BY id",
        )?;
        let views = stmt
            .query_map(params![id], |r| {
                Ok(TableView {
                    view_type: r.get(0)?,
                    arch: r.get(1)?,
                    system: r.get(2)?,
                    field_names: r.get(3)?,
                    field_childs: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Table {
            id,
            name,
            singleton,
            create_date,
            fields,
            views,
        })
    }

    /// Column set of a table, cached by table id.
    pub fn schema_view(&self, conn: &Connection, id: i64) -> Result<Arc<SchemaView>> {
        if let Some(view) = self.views.get(&id) {
            return Ok(view.clone());
        }
        let view = Arc::new(SchemaView::from_table(self.table(conn, id)?));
        self.views.insert(id, view.clone());
        Ok(view)
    }

    /// Forget every cached column set, e.g. after a rollback.
    pub fn clear_cache(&self) {
        self.views.clear();
    }

    /// Delete the metadata and physical table unless a sheet uses it.
    ///
    /// Returns whether the table was deleted. The current-reference check and
    /// the delete are one statement, so a table that became current since the
    /// caller looked at it survives.
    pub fn delete_table(&self, conn: &Connection, table_id: i64) -> Result<bool> {
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM sheetline_table WHERE id = ?1",
                params![table_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Ok(false);
        };

        let deleted = conn.execute(
            "DELETE FROM sheetline_table WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM sheetline_sheet WHERE current_table = ?1)",
            params![table_id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        drop_physical(conn, &name)?;
        self.views.remove(&table_id);
        Ok(true)
    }

    /// Reap tables created more than `days` days ago that no sheet uses.
    pub fn remove_old_tables(&self, conn: &Connection, days: u32) -> Result<Vec<String>> {
        let cutoff = chrono::Utc::now().naive_utc() - chrono::TimeDelta::days(days as i64);
        self.remove_tables_before(conn, cutoff)
    }

    /// Reap unused tables created at or before `cutoff` (UTC). Returns the dropped names.
    ///
    /// Idempotent: a second run finds nothing to do.
    pub fn remove_tables_before(&self, conn: &Connection, cutoff: NaiveDateTime) -> Result<Vec<String>> {
        let _span = tracing::info_span!("reap", cutoff = %cutoff).entered();
        let cutoff = cutoff.format(TIMESTAMP_FORMAT).to_string();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name FROM sheetline_table t
             WHERE t.create_date <= ?1
               AND NOT EXISTS (SELECT 1 FROM sheetline_sheet s WHERE s.current_table = t.id)
             ORDER BY t.id",
        )?;
        let candidates = stmt
            .query_map(params![cutoff], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut removed = Vec::new();
        for (id, name) in candidates {
            if self.delete_table(conn, id)? {
                tracing::debug!(table = %name, "reaped");
                removed.push(name);
            }
        }
        tracing::info!(count = removed.len(), "removed old tables");
        Ok(removed)
    }
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![name],
        |r| r.get(0),
    )?;
    Ok(exists)
}

fn is_current(conn: &Connection, table_id: i64) -> Result<bool> {
    let current: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sheetline_sheet WHERE current_table = ?1)",
        params![table_id],
        |r| r.get(0),
    )?;
    Ok(current)
}

fn drop_physical(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(name)))?;
    conn.execute("DELETE FROM sqlite_sequence WHERE name = ?1", params![name])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;
    use pretty_assertions::assert_eq;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        metadata::init(&conn).unwrap();
        conn
    }

    fn new_table(name: &str, fields: Vec<TableField>) -> NewTable {
        NewTable {
            name: name.to_string(),
            fields,
            ..Default::default()
        }
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM pragma_table_info('{}') ORDER BY cid", table))
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_register_creates_audit_and_stored_columns() {
        let conn = conn();
        let registry = SchemaRegistry::new();
        let mut hidden = TableField::new("tmp", "Tmp", FieldType::Integer);
        hidden.store = false;
        let table = registry
            .register(
                &conn,
                &new_table(
                    "sheet_1_1",
                    vec![TableField::new("a", "A", FieldType::Integer), hidden],
                ),
            )
            .unwrap();

        assert_eq!(
            column_names(&conn, "sheet_1_1"),
            vec!["id", "create_uid", "write_uid", "create_date", "write_date", "a"]
        );
        let view = registry.schema_view(&conn, table.id).unwrap();
        assert_eq!(view.fields.len(), 2);
        assert_eq!(view.columns().count(), 1);
        assert!(view.has_column("write_date"));
        assert!(!view.has_column("tmp"));
    }

    #[test]
    fn test_create_table_replaces_existing() {
        let conn = conn();
        let registry = SchemaRegistry::new();
        conn.execute_batch("CREATE TABLE sheet_9_1 (junk TEXT);").unwrap();
        registry
            .register(&conn, &new_table("sheet_9_1", vec![TableField::new("b", "B", FieldType::Text)]))
            .unwrap();
        assert!(column_names(&conn, "sheet_9_1").contains(&"b".to_string()));
        assert!(!column_names(&conn, "sheet_9_1").contains(&"junk".to_string()));
    }

    #[test]
    fn test_plan_copy_reports_lost_changed_missing() {
        let source = vec![
            TableField::new("a", "A", FieldType::Integer),
            TableField::new("b", "B", FieldType::Text),
            TableField::new("d", "D", FieldType::Integer),
        ];
        let destination = vec![
            TableField::new("a", "A", FieldType::Integer),
            TableField::new("c", "C", FieldType::Text),
            TableField::new("d", "D", FieldType::Date),
        ];
        let report = plan_copy(&source, &destination);
        assert_eq!(report.copied, vec!["a"]);
        assert_eq!(report.lost, vec!["b"]);
        assert_eq!(report.changed, vec!["d (integer -> date)"]);
        assert_eq!(report.missing, vec!["c"]);
        assert!(report.has_losses());
    }

    #[test]
    fn test_icon_and_text_are_compatible() {
        let report = plan_copy(
            &[TableField::new("a", "A", FieldType::Text)],
            &[TableField::new("a", "A", FieldType::Icon)],
        );
        assert_eq!(report.copied, vec!["a"]);
        assert!(!report.has_losses());
    }

    #[test]
    fn test_copy_with_empty_intersection_is_noop() {
        let conn = conn();
        let registry = SchemaRegistry::new();
        let old = registry
            .register(&conn, &new_table("t_old", vec![TableField::new("a", "A", FieldType::Integer)]))
            .unwrap();
        let new = registry
            .register(&conn, &new_table("t_new", vec![TableField::new("z", "Z", FieldType::Integer)]))
            .unwrap();
        conn.execute("INSERT INTO t_old (a) VALUES (1)", []).unwrap();
        let report = registry.copy_from(&conn, &new, &old).unwrap();
        assert_eq!(report.rows, 0);
        assert_eq!(registry.count(&conn, &new).unwrap(), 0);
    }

    #[test]
    fn test_drop_table_refuses_current_table() {
        let conn = conn();
        let registry = SchemaRegistry::new();
        let table = registry.register(&conn, &new_table("t1", vec![])).unwrap();
        conn.execute(
            "INSERT INTO sheetline_sheet (name, alias, current_table) VALUES ('s', 's', ?1)",
            params![table.id],
        )
        .unwrap();
        assert!(matches!(
            registry.drop_table(&conn, &table),
            Err(SheetlineError::TableInUse(_))
        ));
        assert!(!registry.delete_table(&conn, table.id).unwrap());
        assert!(table_exists(&conn, "t1").unwrap());
    }

    #[test]
    fn test_reaper_skips_current_and_is_idempotent() {
        let conn = conn();
        let registry = SchemaRegistry::new();
        let keep = registry.register(&conn, &new_table("keep", vec![])).unwrap();
        registry.register(&conn, &new_table("old", vec![])).unwrap();
        conn.execute(
            "INSERT INTO sheetline_sheet (name, alias, current_table) VALUES ('s', 's', ?1)",
            params![keep.id],
        )
        .unwrap();

        let future = chrono::Utc::now().naive_utc() + chrono::TimeDelta::days(1);
        let removed = registry.remove_tables_before(&conn, future).unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(!table_exists(&conn, "old").unwrap());
        assert!(table_exists(&conn, "keep").unwrap());

        assert!(registry.remove_tables_before(&conn, future).unwrap().is_empty());
    }

    #[test]
    fn test_reaper_respects_age() {
        let conn = conn();
        let registry = SchemaRegistry::new();
        registry.register(&conn, &new_table("young", vec![])).unwrap();
        assert!(registry.remove_old_tables(&conn, 1).unwrap().is_empty());
        assert!(table_exists(&conn, "young").unwrap());
    }
}
