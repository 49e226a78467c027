//! Sheets, their formulas, and the validators that guard them.
//!
//! A sheet *has* a lifecycle state and *has* a tag set; validation is a set
//! of free functions invoked explicitly before anything is saved.

use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use sheetline_engine::FieldType;
use sheetline_engine::engine::{Declaration, convert_to_symbol, invalid_symbol};

use crate::error::{Result, SheetlineError};
use crate::schema::{TableField, is_system_column};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum SheetState {
    #[default]
    Draft,
    Active,
    Canceled,
}

impl SheetState {
    pub fn as_str(self) -> &'static str {
        match self {
            SheetState::Draft => "draft",
            SheetState::Active => "active",
            SheetState::Canceled => "canceled",
        }
    }

    pub fn can_transition(self, to: SheetState) -> bool {
        use SheetState::*;
        matches!(
            (self, to),
            (Draft, Active) | (Draft, Canceled) | (Active, Draft) | (Active, Canceled) | (Canceled, Draft)
        )
    }

    /// Check that moving to `to` is allowed.
    pub fn transition(self, to: SheetState) -> Result<SheetState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(SheetlineError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for SheetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SheetState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(SheetState::Draft),
            "active" => Ok(SheetState::Active),
            "canceled" => Ok(SheetState::Canceled),
            other => Err(format!("Unknown sheet state: {}", other)),
        }
    }
}

/// One column definition of a sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct Formula {
    pub name: String,
    pub alias: String,
    /// `=...` formula or a static value; `None` copies the dataset column.
    pub expression: Option<String>,
    pub field_type: Option<FieldType>,
    pub link_target: Option<String>,
    pub store: bool,
}

impl Formula {
    /// A stored formula whose alias is derived from `name`.
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Formula {
            name: name.to_string(),
            alias: convert_to_symbol(name),
            expression: None,
            field_type: Some(field_type),
            link_target: None,
            store: true,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn with_expression(mut self, expression: &str) -> Self {
        self.expression = Some(expression.to_string());
        self
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref().filter(|e| !e.trim().is_empty())
    }

    /// Whether values are copied from the dataset rather than computed.
    pub fn is_direct(&self) -> bool {
        self.expression().is_none()
    }

    pub fn declaration(&self) -> Declaration<'_> {
        Declaration {
            alias: &self.alias,
            expression: self.expression(),
        }
    }

    pub fn to_field(&self) -> TableField {
        TableField {
            name: self.alias.clone(),
            string: self.name.clone(),
            field_type: self.field_type,
            help: None,
            link_target: self.link_target.clone(),
            formula: self.expression().map(str::to_string),
            store: self.store,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sheet {
    pub id: i64,
    pub name: String,
    pub alias: String,
    pub revision: i64,
    pub state: SheetState,
    pub singleton: bool,
    /// Compute timeout in seconds; 0 disables it.
    pub timeout: u64,
    pub dataset_id: Option<i64>,
    pub current_table: Option<i64>,
    pub tags: BTreeSet<String>,
    pub formulas: Vec<Formula>,
}

impl Sheet {
    /// Physical table name of the current revision.
    pub fn data_table_name(&self) -> String {
        self.table_name(self.revision)
    }

    pub fn table_name(&self, revision: i64) -> String {
        format!("sheet_{}_{}", self.id, revision)
    }

    pub fn declarations(&self) -> Vec<Declaration<'_>> {
        self.formulas.iter().map(Formula::declaration).collect()
    }

    pub fn formula(&self, alias: &str) -> Option<&Formula> {
        self.formulas.iter().find(|f| f.alias == alias)
    }
}

/// Definition of a sheet to create.
#[derive(Clone, Debug, Default)]
pub struct NewSheet {
    pub name: String,
    /// Derived from `name` when absent.
    pub alias: Option<String>,
    pub singleton: bool,
    /// Falls back to the configured default when absent.
    pub timeout: Option<u64>,
    pub dataset_id: Option<i64>,
    pub tags: BTreeSet<String>,
    pub formulas: Vec<Formula>,
}

impl NewSheet {
    pub fn alias(&self) -> String {
        self.alias.clone().unwrap_or_else(|| convert_to_symbol(&self.name))
    }
}

/// Reject aliases outside the symbol grammar.
pub fn validate_alias(name: &str, alias: &str) -> Result<()> {
    match invalid_symbol(alias) {
        None => Ok(()),
        Some(symbol) => Err(SheetlineError::InvalidAlias {
            symbol,
            name: name.to_string(),
        }),
    }
}

/// Validate the formula list of a sheet as a whole.
pub fn validate_formulas(formulas: &[Formula]) -> Result<()> {
    let mut seen = HashSet::new();
    for formula in formulas {
        validate_alias(&formula.name, &formula.alias)?;
        if is_system_column(&formula.alias) {
            return Err(SheetlineError::ReservedAlias {
                alias: formula.alias.clone(),
            });
        }
        if !seen.insert(formula.alias.as_str()) {
            return Err(SheetlineError::DuplicateAlias {
                alias: formula.alias.clone(),
            });
        }
        if formula.store && formula.field_type.is_none() {
            return Err(SheetlineError::InvalidStore {
                name: formula.name.clone(),
            });
        }
        if formula.field_type == Some(FieldType::Link)
            && formula.link_target.as_deref().is_none_or(|t| t.trim().is_empty())
        {
            return Err(SheetlineError::MissingLinkTarget {
                name: formula.name.clone(),
            });
        }
    }
    Ok(())
}

/// Warning keys the caller has acknowledged.
#[derive(Clone, Debug, Default)]
pub struct Warnings {
    accepted: HashSet<String>,
    accept_all: bool,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge every warning.
    pub fn accept_all() -> Self {
        Warnings {
            accepted: HashSet::new(),
            accept_all: true,
        }
    }

    pub fn accept(&mut self, key: impl Into<String>) {
        self.accepted.insert(key.into());
    }

    /// Fail with a [`SheetlineError::UserWarning`] unless `key` was acknowledged.
    pub fn check(&self, key: &str, message: impl FnOnce() -> String) -> Result<()> {
        if self.accept_all || self.accepted.contains(key) {
            Ok(())
        } else {
            Err(SheetlineError::UserWarning {
                key: key.to_string(),
                message: message(),
            })
        }
    }
}

// Persistence

const SHEET_COLUMNS: &str =
    "id, name, alias, revision, state, singleton, timeout, dataset_id, current_table";

fn sheet_from_row(row: &Row<'_>) -> rusqlite::Result<Sheet> {
    let state: String = row.get(4)?;
    let state = state.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Sheet {
        id: row.get(0)?,
        name: row.get(1)?,
        alias: row.get(2)?,
        revision: row.get(3)?,
        state,
        singleton: row.get(5)?,
        timeout: row.get::<_, i64>(6)?.max(0) as u64,
        dataset_id: row.get(7)?,
        current_table: row.get(8)?,
        tags: BTreeSet::new(),
        formulas: Vec::new(),
    })
}

/// Insert a draft sheet with its formulas and tags.
/// Timeouts are stored as SQLite integers.
fn timeout_param(timeout: u64) -> Result<i64> {
    i64::try_from(timeout).map_err(|_| SheetlineError::InvalidTimeout(timeout))
}

pub fn insert_sheet(conn: &Connection, new: &NewSheet, default_timeout: u64) -> Result<Sheet> {
    let alias = new.alias();
    validate_alias(&new.name, &alias)?;
    validate_formulas(&new.formulas)?;

    let timeout = new.timeout.unwrap_or(default_timeout);
    let stored_timeout = timeout_param(timeout)?;
    conn.execute(
        "INSERT INTO sheetline_sheet (name, alias, singleton, timeout, dataset_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![new.name, alias, new.singleton, stored_timeout, new.dataset_id],
    )?;
    let id = conn.last_insert_rowid();
    write_formulas(conn, id, &new.formulas)?;
    write_tags(conn, id, &new.tags)?;
    load_sheet(conn, id)
}

pub fn load_sheet(conn: &Connection, id: i64) -> Result<Sheet> {
    let sheet = conn
        .query_row(
            &format!("SELECT {} FROM sheetline_sheet WHERE id = ?1", SHEET_COLUMNS),
            params![id],
            sheet_from_row,
        )
        .optional()?;
    match sheet {
        Some(sheet) => with_children(conn, sheet),
        None => Err(SheetlineError::UnknownSheet(id.to_string())),
    }
}

pub fn find_sheet(conn: &Connection, alias: &str) -> Result<Option<Sheet>> {
    let sheet = conn
        .query_row(
            &format!("SELECT {} FROM sheetline_sheet WHERE alias = ?1", SHEET_COLUMNS),
            params![alias],
            sheet_from_row,
        )
        .optional()?;
    sheet.map(|s| with_children(conn, s)).transpose()
}

pub fn load_sheet_by_alias(conn: &Connection, alias: &str) -> Result<Sheet> {
    find_sheet(conn, alias)?.ok_or_else(|| SheetlineError::UnknownSheet(alias.to_string()))
}

/// Every sheet, without formulas, ordered by alias.
pub fn list_sheets(conn: &Connection) -> Result<Vec<Sheet>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sheetline_sheet ORDER BY alias",
        SHEET_COLUMNS
    ))?;
    let sheets = stmt
        .query_map([], sheet_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    sheets
        .into_iter()
        .map(|mut sheet| {
            sheet.tags = load_tags(conn, sheet.id)?;
            Ok(sheet)
        })
        .collect()
}

fn with_children(conn: &Connection, mut sheet: Sheet) -> Result<Sheet> {
    sheet.formulas = load_formulas(conn, sheet.id)?;
    sheet.tags = load_tags(conn, sheet.id)?;
    Ok(sheet)
}

fn load_formulas(conn: &Connection, sheet_id: i64) -> Result<Vec<Formula>> {
    let mut stmt = conn.prepare(
        "SELECT name, alias, expression, type, link_target, store
         FROM sheetline_formula WHERE sheet_id = ?1 ORDER BY sequence, id",
    )?;
    let formulas = stmt
        .query_map(params![sheet_id], |r| {
            let kind: Option<String> = r.get(3)?;
            Ok(Formula {
                name: r.get(0)?,
                alias: r.get(1)?,
                expression: r.get(2)?,
                field_type: kind.as_deref().and_then(FieldType::from_name),
                link_target: r.get(4)?,
                store: r.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(formulas)
}

fn write_formulas(conn: &Connection, sheet_id: i64, formulas: &[Formula]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO sheetline_formula
           (sheet_id, sequence, name, alias, expression, type, link_target, store)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (sequence, f) in formulas.iter().enumerate() {
        stmt.execute(params![
            sheet_id,
            sequence as i64,
            f.name,
            f.alias,
            f.expression,
            f.field_type.map(|t| t.name()),
            f.link_target,
            f.store,
        ])?;
    }
    Ok(())
}

fn load_tags(conn: &Connection, sheet_id: i64) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM sheetline_sheet_tag WHERE sheet_id = ?1")?;
    let tags = stmt
        .query_map(params![sheet_id], |r| r.get(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;
    Ok(tags)
}

fn write_tags(conn: &Connection, sheet_id: i64, tags: &BTreeSet<String>) -> Result<()> {
    conn.execute("DELETE FROM sheetline_sheet_tag WHERE sheet_id = ?1", params![sheet_id])?;
    let mut stmt = conn.prepare("INSERT INTO sheetline_sheet_tag (sheet_id, tag) VALUES (?1, ?2)")?;
    for tag in tags {
        stmt.execute(params![sheet_id, tag])?;
    }
    Ok(())
}

pub fn set_tags(conn: &Connection, sheet: &mut Sheet, tags: BTreeSet<String>) -> Result<()> {
    write_tags(conn, sheet.id, &tags)?;
    sheet.tags = tags;
    Ok(())
}

fn ensure_draft(sheet: &Sheet) -> Result<()> {
    if sheet.state == SheetState::Draft {
        Ok(())
    } else {
        Err(SheetlineError::NotDraft(sheet.alias.clone()))
    }
}

/// Replace the formula list of a draft sheet.
pub fn replace_formulas(conn: &Connection, sheet: &mut Sheet, formulas: Vec<Formula>) -> Result<()> {
    ensure_draft(sheet)?;
    validate_formulas(&formulas)?;
    conn.execute("DELETE FROM sheetline_formula WHERE sheet_id = ?1", params![sheet.id])?;
    write_formulas(conn, sheet.id, &formulas)?;
    sheet.formulas = formulas;
    Ok(())
}

/// Attach (or detach) the dataset of a draft sheet.
pub fn set_dataset(conn: &Connection, sheet: &mut Sheet, dataset_id: Option<i64>) -> Result<()> {
    ensure_draft(sheet)?;
    conn.execute(
        "UPDATE sheetline_sheet SET dataset_id = ?2 WHERE id = ?1",
        params![sheet.id, dataset_id],
    )?;
    sheet.dataset_id = dataset_id;
    Ok(())
}

/// Update the scalar settings of a draft sheet.
pub fn update_settings(
    conn: &Connection,
    sheet: &mut Sheet,
    name: &str,
    singleton: bool,
    timeout: u64,
) -> Result<()> {
    ensure_draft(sheet)?;
    conn.execute(
        "UPDATE sheetline_sheet SET name = ?2, singleton = ?3, timeout = ?4 WHERE id = ?1",
        params![sheet.id, name, singleton, timeout_param(timeout)?],
    )?;
    sheet.name = name.to_string();
    sheet.singleton = singleton;
    sheet.timeout = timeout;
    Ok(())
}

/// Persist state, revision and current table.
pub(crate) fn save_binding(conn: &Connection, sheet: &Sheet) -> Result<()> {
    conn.execute(
        "UPDATE sheetline_sheet SET state = ?2, revision = ?3, current_table = ?4 WHERE id = ?1",
        params![sheet.id, sheet.state.as_str(), sheet.revision, sheet.current_table],
    )?;
    Ok(())
}

pub fn delete_sheet(conn: &Connection, sheet: &Sheet) -> Result<()> {
    conn.execute("DELETE FROM sheetline_sheet WHERE id = ?1", params![sheet.id])?;
    Ok(())
}
