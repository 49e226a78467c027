//! Compute pipeline: rebuilds a sheet's materialized table.
//!
//! A run deletes every row, then streams the dataset batch by batch. Direct
//! columns are copied from each record; derived columns are evaluated in
//! declaration order against the values computed so far. Each batch is
//! written with bulk `INSERT` statements. A [`Deadline`] is polled once per
//! batch and once per record.

use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sheetline_engine::engine::RowValues;
use sheetline_engine::{Compiled, FieldType, FormulaCompiler, Value};

use crate::dataset::{Datasets, Record, load_dataset};
use crate::error::{Result, SheetlineError};
use crate::schema::{AUDIT_COLUMNS, SchemaRegistry, TableField};
use crate::sheet::{Sheet, find_sheet};
use crate::sql::{MAX_PARAMS, now_timestamp, placeholders, quote_ident, to_sql};

/// Cooperative wall-clock limit.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    /// A deadline `seconds` from now; 0 never expires.
    pub fn after_secs(seconds: u64) -> Self {
        Deadline {
            start: Instant::now(),
            limit: (seconds > 0).then(|| Duration::from_secs(seconds)),
        }
    }

    pub fn unlimited() -> Self {
        Deadline {
            start: Instant::now(),
            limit: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() > limit)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ComputeState {
    #[default]
    Idle,
    Fetching,
    Evaluating,
    Inserting,
    Done,
    TimedOut,
}

impl fmt::Display for ComputeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComputeState::Idle => "idle",
            ComputeState::Fetching => "fetching",
            ComputeState::Evaluating => "evaluating",
            ComputeState::Inserting => "inserting",
            ComputeState::Done => "done",
            ComputeState::TimedOut => "timed_out",
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ComputeReport {
    pub state: ComputeState,
    pub batches: usize,
    pub rows: usize,
    /// Rows discarded because the sheet is a singleton.
    pub dropped: usize,
    pub elapsed: Duration,
}

struct DerivedStep {
    alias: String,
    field_type: Option<FieldType>,
    compiled: Compiled,
}

/// Derived columns of a table, compiled once and applied row by row.
pub struct Derivation {
    steps: Vec<DerivedStep>,
}

impl Derivation {
    /// Compile every derived field, in order.
    pub fn compile<'f>(
        compiler: &FormulaCompiler,
        fields: impl IntoIterator<Item = &'f TableField>,
    ) -> Result<Self> {
        let mut steps = Vec::new();
        for field in fields.into_iter().filter(|f| f.is_derived()) {
            let Some(expression) = field.formula.as_deref() else {
                continue;
            };
            steps.push(DerivedStep {
                alias: field.name.clone(),
                field_type: field.field_type,
                compiled: compiler.compile(expression)?,
            });
        }
        Ok(Derivation { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.alias.as_str())
    }

    /// Sheets read through `SHEET_LOOKUP`.
    pub fn sheet_lookups(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter_map(|s| s.compiled.program())
            .flat_map(|p| p.sheet_lookups().iter().cloned())
            .collect()
    }

    /// Evaluate every step against `row`, appending each result.
    pub fn apply(&self, compiler: &FormulaCompiler, row: &mut RowValues) {
        for step in &self.steps {
            let value = match &step.compiled {
                Compiled::Static(text) => Value::Text(text.clone()),
                Compiled::Formula(program) => compiler.evaluate(program, row),
            };
            row.insert(&step.alias, coerce(step.field_type, value));
        }
    }
}

pub(crate) fn coerce(field_type: Option<FieldType>, value: Value) -> Value {
    match field_type {
        Some(t) => t.parse(value),
        None => value,
    }
}

/// Fill the compiler's lookup cache with the current rows of `sheets`.
///
/// Unknown sheets and sheets without a current table are skipped, so their
/// lookups evaluate to null.
pub fn preload_lookups(
    conn: &Connection,
    registry: &SchemaRegistry,
    compiler: &FormulaCompiler,
    sheets: &BTreeSet<String>,
) -> Result<()> {
    let cache = compiler.lookups();
    cache.clear();
    for alias in sheets {
        let Some(table_id) = find_sheet(conn, alias)?.and_then(|s| s.current_table) else {
            tracing::debug!(sheet = %alias, "lookup target has no table");
            continue;
        };
        let view = registry.schema_view(conn, table_id)?;
        let (columns, rows) = view.scan(conn)?;
        let rows: Vec<HashMap<String, Value>> = rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect();
        tracing::debug!(sheet = %alias, rows = rows.len(), "preloaded lookup rows");
        cache.insert_sheet(alias, rows);
    }
    Ok(())
}

/// Insert `rows` in as few statements as the parameter limit allows,
/// stamping the audit columns. Returns the number of rows written.
pub(crate) fn bulk_insert(
    conn: &Connection,
    table: &str,
    columns: &[String],
    rows: &[Vec<Value>],
    user_id: i64,
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let now = now_timestamp();
    let names = columns
        .iter()
        .map(|c| quote_ident(c))
        .chain(AUDIT_COLUMNS.iter().map(|c| quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let width = columns.len() + AUDIT_COLUMNS.len();
    let tuple = format!("({})", placeholders(width));
    let per_statement = (MAX_PARAMS / width).max(1);

    for chunk in rows.chunks(per_statement) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(table),
            names,
            vec![tuple.as_str(); chunk.len()].join(", ")
        );
        let mut params: Vec<SqlValue> = Vec::with_capacity(chunk.len() * width);
        for row in chunk {
            params.extend(row.iter().map(to_sql));
            params.push(SqlValue::Integer(user_id));
            params.push(SqlValue::Integer(user_id));
            params.push(SqlValue::Text(now.clone()));
            params.push(SqlValue::Text(now.clone()));
        }
        conn.execute(&sql, rusqlite::params_from_iter(params))?;
    }
    Ok(rows.len())
}

/// Rebuilds sheet tables from their datasets.
pub struct ComputePipeline {
    registry: Arc<SchemaRegistry>,
    datasets: Arc<Datasets>,
    compiler: Arc<FormulaCompiler>,
}

struct Run<'s> {
    sheet: &'s Sheet,
    deadline: Deadline,
    report: ComputeReport,
}

impl Run<'_> {
    fn set_state(&mut self, state: ComputeState) {
        if self.report.state != state {
            tracing::trace!(sheet = %self.sheet.alias, from = %self.report.state, to = %state, "compute state");
            self.report.state = state;
        }
    }

    fn check_deadline(&mut self) -> Result<()> {
        if self.deadline.expired() {
            self.set_state(ComputeState::TimedOut);
            tracing::warn!(sheet = %self.sheet.alias, seconds = self.sheet.timeout, "compute timed out");
            return Err(SheetlineError::Timeout {
                sheet: self.sheet.alias.clone(),
                seconds: self.sheet.timeout,
            });
        }
        Ok(())
    }
}

impl ComputePipeline {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        datasets: Arc<Datasets>,
        compiler: Arc<FormulaCompiler>,
    ) -> Self {
        ComputePipeline {
            registry,
            datasets,
            compiler,
        }
    }

    /// Rebuild the current table of `sheet` under its own timeout.
    pub fn compute_sheet(&self, conn: &Connection, sheet: &Sheet, user_id: i64) -> Result<ComputeReport> {
        self.compute_with_deadline(conn, sheet, user_id, Deadline::after_secs(sheet.timeout))
    }

    pub fn compute_with_deadline(
        &self,
        conn: &Connection,
        sheet: &Sheet,
        user_id: i64,
        deadline: Deadline,
    ) -> Result<ComputeReport> {
        let _span = tracing::info_span!("compute", sheet = %sheet.alias, revision = sheet.revision).entered();
        let table_id = sheet.current_table.ok_or(SheetlineError::NoActiveTable)?;
        let view = self.registry.schema_view(conn, table_id)?;
        let mut run = Run {
            sheet,
            deadline,
            report: ComputeReport::default(),
        };

        conn.execute(&format!("DELETE FROM {}", view.quoted_name()), [])?;

        let Some(dataset_id) = sheet.dataset_id else {
            tracing::debug!("no dataset, table left empty");
            run.set_state(ComputeState::Done);
            run.report.elapsed = run.deadline.elapsed();
            return Ok(run.report);
        };
        let dataset = load_dataset(conn, dataset_id)?;

        let fields: Vec<TableField> = sheet.formulas.iter().map(|f| f.to_field()).collect();
        let direct: Vec<&TableField> = fields.iter().filter(|f| !f.is_derived()).collect();
        let derivation = Derivation::compile(&self.compiler, &fields)?;
        preload_lookups(conn, &self.registry, &self.compiler, &derivation.sheet_lookups())?;

        // Stored columns in sheet order; the row map may hold more.
        let columns: Vec<String> = fields
            .iter()
            .filter(|f| f.is_column())
            .map(|f| f.name.clone())
            .collect();
        let fast_path = derivation.is_empty();

        run.set_state(ComputeState::Fetching);
        for batch in self.datasets.get_data(conn, &dataset)? {
            let batch = batch?;
            run.check_deadline()?;
            run.report.batches += 1;

            run.set_state(ComputeState::Evaluating);
            let mut rows = Vec::with_capacity(batch.len());
            for record in &batch {
                run.check_deadline()?;
                let values = if fast_path {
                    direct_values(record, &columns, &fields)
                } else {
                    let mut row = RowValues::with_capacity(fields.len());
                    for field in &direct {
                        let value = record.get(&field.name).cloned().unwrap_or_default();
                        row.insert(&field.name, coerce(field.field_type, value));
                    }
                    derivation.apply(&self.compiler, &mut row);
                    columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or_default())
                        .collect()
                };
                rows.push(values);
            }

            if view.singleton {
                let room = usize::from(run.report.rows == 0);
                if rows.len() > room {
                    let dropped = rows.len() - room;
                    tracing::warn!(dropped, "singleton sheet keeps only its first row");
                    run.report.dropped += dropped;
                    rows.truncate(room);
                }
            }

            run.set_state(ComputeState::Inserting);
            run.report.rows += bulk_insert(conn, &view.table_name, &columns, &rows, user_id)?;
            tracing::debug!(batch = run.report.batches, rows = rows.len(), "inserted batch");
            run.set_state(ComputeState::Fetching);
        }

        run.set_state(ComputeState::Done);
        run.report.elapsed = run.deadline.elapsed();
        tracing::info!(rows = run.report.rows, batches = run.report.batches, "computed sheet");
        Ok(run.report)
    }
}

fn direct_values(record: &Record, columns: &[String], fields: &[TableField]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| {
            let field_type = fields.iter().find(|f| &f.name == c).and_then(|f| f.field_type);
            coerce(field_type, record.get(c).cloned().unwrap_or_default())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;
    use crate::schema::NewTable;

    #[test]
    fn test_deadline() {
        assert!(!Deadline::after_secs(0).expired());
        assert!(!Deadline::after_secs(60).expired());
        let past = Deadline {
            start: Instant::now() - Duration::from_secs(5),
            limit: Some(Duration::from_secs(1)),
        };
        assert!(past.expired());
    }

    #[test]
    fn test_derivation_applies_in_order() {
        let compiler = FormulaCompiler::new();
        let mut y = TableField::new("y", "Y", FieldType::Float);
        y.formula = Some("=x*2".into());
        let mut label = TableField::new("label", "Label", FieldType::Text);
        label.formula = Some("=\"x=\" & x".into());
        let mut fixed = TableField::new("k", "K", FieldType::Integer);
        fixed.formula = Some("7".into());
        let fields = [TableField::new("x", "X", FieldType::Integer), y, label, fixed];

        let derivation = Derivation::compile(&compiler, &fields).unwrap();
        assert_eq!(derivation.aliases().collect::<Vec<_>>(), vec!["y", "label", "k"]);

        let mut row = RowValues::new();
        row.insert("x", Value::Integer(3));
        derivation.apply(&compiler, &mut row);
        assert_eq!(row.get("y"), Some(&Value::Float(6.0)));
        assert_eq!(row.get("label"), Some(&Value::Text("x=3".into())));
        assert_eq!(row.get("k"), Some(&Value::Integer(7)));
    }

    #[test]
    fn test_bulk_insert_chunks_and_stamps() {
        let conn = Connection::open_in_memory().unwrap();
        metadata::init(&conn).unwrap();
        let registry = SchemaRegistry::new();
        let fields: Vec<TableField> = (0..40)
            .map(|i| TableField::new(&format!("c{}", i), "C", FieldType::Integer))
            .collect();
        registry
            .register(
                &conn,
                &NewTable {
                    name: "wide".into(),
                    fields: fields.clone(),
                    ..Default::default()
                },
            )
            .unwrap();
        let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        // 44 parameters per row, so 2000 rows need several statements.
        let rows: Vec<Vec<Value>> = (0..2000).map(|i| vec![Value::Integer(i); 40]).collect();
        assert_eq!(bulk_insert(&conn, "wide", &columns, &rows, 7).unwrap(), 2000);

        let (count, uid): (i64, i64) = conn
            .query_row("SELECT COUNT(*), MIN(create_uid) FROM wide", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!((count, uid), (2000, 7));
    }
}
