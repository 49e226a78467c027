//! Host session: one SQLite connection plus the components wired around it.
//!
//! Every mutating operation runs in its own transaction, so a failure (a
//! timeout, an unacknowledged warning) leaves the database as it was.

use chrono::NaiveDateTime;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sheetline_engine::FormulaCompiler;
use sheetline_engine::engine::{FormulaCheck, RowValues};

use crate::config::Config;
use crate::dataset::{Dataset, DatasetSource, Datasets, ModelProvider, ProviderReader, insert_dataset};
use crate::error::{Result, SheetlineError};
use crate::lifecycle::{ActivationReport, SheetManager};
use crate::metadata;
use crate::pipeline::ComputeReport;
use crate::records::{ActiveContext, RecordAccess};
use crate::schema::SchemaRegistry;
use crate::sheet::{
    Formula, NewSheet, Sheet, SheetState, Warnings, delete_sheet, find_sheet, insert_sheet, list_sheets,
    load_sheet_by_alias, replace_formulas, set_dataset, set_tags, update_settings,
};
use crate::view::{View, insert_view, list_views};

/// Concatenate the function scripts in `paths`, or `None` when there are none.
fn read_functions(paths: &[PathBuf]) -> Result<Option<String>> {
    let mut script: Option<String> = None;
    for path in paths {
        let content = fs::read_to_string(path)?;
        match &mut script {
            Some(existing) => {
                existing.push_str("\n\n");
                existing.push_str(&content);
            }
            None => script = Some(content),
        }
    }
    Ok(script)
}

pub struct Session {
    conn: Connection,
    config: Config,
    registry: Arc<SchemaRegistry>,
    datasets: Arc<Datasets>,
    manager: SheetManager,
    records: RecordAccess,
}

impl Session {
    pub fn open(path: impl AsRef<Path>, config: Config, provider: Option<Arc<dyn ModelProvider>>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn, config, provider)
    }

    pub fn open_in_memory(config: Config, provider: Option<Arc<dyn ModelProvider>>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config, provider)
    }

    pub fn with_connection(
        conn: Connection,
        config: Config,
        provider: Option<Arc<dyn ModelProvider>>,
    ) -> Result<Self> {
        metadata::init(&conn)?;
        let registry = Arc::new(SchemaRegistry::new());
        let mut compiler = match &provider {
            Some(p) => FormulaCompiler::with_model_reader(Arc::new(ProviderReader(p.clone()))),
            None => FormulaCompiler::new(),
        };
        if let Some(script) = read_functions(&config.functions)? {
            let names = compiler.load_functions(&script)?;
            tracing::debug!(functions = ?names, "loaded script functions");
        }
        let compiler = Arc::new(compiler);
        let datasets = Arc::new(Datasets::new(registry.clone(), provider, config.cache_size));
        let manager = SheetManager::new(registry.clone(), datasets.clone(), compiler.clone(), config.user_id);
        let records = RecordAccess::new(registry.clone(), compiler, config.user_id);
        Ok(Session {
            conn,
            config,
            registry,
            datasets,
            manager,
            records,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn datasets(&self) -> &Datasets {
        &self.datasets
    }

    pub fn manager(&self) -> &SheetManager {
        &self.manager
    }

    pub fn records(&self) -> &RecordAccess {
        &self.records
    }

    fn in_transaction<T>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        // Components borrow `self`, so the transaction is opened on a shared reference.
        let tx = Transaction::new_unchecked(&self.conn, behavior)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(error = %rollback, cause = %e, "rollback failed");
                }
                self.registry.clear_cache();
                Err(e)
            }
        }
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.in_transaction(TransactionBehavior::Deferred, f)
    }

    // Definitions

    pub fn create_dataset(&self, name: &str, source: &DatasetSource) -> Result<Dataset> {
        self.write(|conn| insert_dataset(conn, name, source))
    }

    pub fn create_sheet(&self, new: &NewSheet) -> Result<Sheet> {
        self.write(|conn| insert_sheet(conn, new, self.config.default_timeout))
    }

    /// Create the sheet, or replace the definition of the draft sheet with
    /// the same alias. A given dataset source is stored as a new dataset.
    pub fn define(&self, new: &NewSheet, dataset: Option<(&str, &DatasetSource)>) -> Result<Sheet> {
        self.write(|conn| {
            let dataset_id = match dataset {
                Some((name, source)) => Some(insert_dataset(conn, name, source)?.id),
                None => new.dataset_id,
            };
            match find_sheet(conn, &new.alias())? {
                None => insert_sheet(
                    conn,
                    &NewSheet {
                        dataset_id,
                        ..new.clone()
                    },
                    self.config.default_timeout,
                ),
                Some(mut sheet) => {
                    let timeout = new.timeout.unwrap_or(sheet.timeout);
                    update_settings(conn, &mut sheet, &new.name, new.singleton, timeout)?;
                    replace_formulas(conn, &mut sheet, new.formulas.clone())?;
                    set_dataset(conn, &mut sheet, dataset_id)?;
                    set_tags(conn, &mut sheet, new.tags.clone())?;
                    Ok(sheet)
                }
            }
        })
    }

    pub fn sheet(&self, alias: &str) -> Result<Sheet> {
        load_sheet_by_alias(&self.conn, alias)
    }

    pub fn sheets(&self) -> Result<Vec<Sheet>> {
        list_sheets(&self.conn)
    }

    pub fn set_formulas(&self, alias: &str, formulas: Vec<Formula>) -> Result<Sheet> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            replace_formulas(conn, &mut sheet, formulas)?;
            Ok(sheet)
        })
    }

    pub fn attach_dataset(&self, alias: &str, dataset_id: Option<i64>) -> Result<Sheet> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            set_dataset(conn, &mut sheet, dataset_id)?;
            Ok(sheet)
        })
    }

    pub fn set_tags(&self, alias: &str, tags: BTreeSet<String>) -> Result<Sheet> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            set_tags(conn, &mut sheet, tags)?;
            Ok(sheet)
        })
    }

    /// Delete a sheet that is not active. Its tables are left to the reaper.
    pub fn delete_sheet(&self, alias: &str) -> Result<()> {
        self.write(|conn| {
            let sheet = load_sheet_by_alias(conn, alias)?;
            if sheet.state == SheetState::Active {
                return Err(SheetlineError::InvalidTransition {
                    from: sheet.state,
                    to: SheetState::Canceled,
                });
            }
            delete_sheet(conn, &sheet)
        })
    }

    pub fn create_view(&self, alias: &str, name: &str, view_type: &str) -> Result<View> {
        self.write(|conn| {
            let sheet = load_sheet_by_alias(conn, alias)?;
            insert_view(conn, name, sheet.id, view_type)
        })
    }

    pub fn views(&self, alias: &str) -> Result<Vec<View>> {
        list_views(&self.conn, self.sheet(alias)?.id)
    }

    // Lifecycle

    pub fn check(&self, alias: &str) -> Result<Vec<FormulaCheck>> {
        Ok(self.manager.check(&self.sheet(alias)?))
    }

    pub fn activate(&self, alias: &str, warnings: &Warnings) -> Result<ActivationReport> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            self.manager.activate(conn, &mut sheet, warnings)
        })
    }

    pub fn draft(&self, alias: &str) -> Result<Sheet> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            self.manager.draft(conn, &mut sheet)?;
            Ok(sheet)
        })
    }

    pub fn cancel(&self, alias: &str) -> Result<Sheet> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            self.manager.cancel(conn, &mut sheet)?;
            Ok(sheet)
        })
    }

    /// Rebuild a sheet's table. On timeout the previous rows are restored.
    pub fn compute(&self, alias: &str) -> Result<ComputeReport> {
        self.write(|conn| {
            let sheet = load_sheet_by_alias(conn, alias)?;
            self.manager.compute(conn, &sheet)
        })
    }

    /// Add formulas for dataset fields the sheet does not have yet.
    pub fn update_formulas(&self, alias: &str) -> Result<usize> {
        self.write(|conn| {
            let mut sheet = load_sheet_by_alias(conn, alias)?;
            self.manager.update_formulas(conn, &mut sheet)
        })
    }

    /// Drop unused tables older than `days`. Takes the write lock up front.
    pub fn reap(&self, days: u32) -> Result<Vec<String>> {
        self.in_transaction(TransactionBehavior::Immediate, |conn| {
            self.registry.remove_old_tables(conn, days)
        })
    }

    pub fn reap_before(&self, cutoff: NaiveDateTime) -> Result<Vec<String>> {
        self.in_transaction(TransactionBehavior::Immediate, |conn| {
            self.registry.remove_tables_before(conn, cutoff)
        })
    }

    // Records

    pub fn create_records(&self, ctx: &ActiveContext, rows: &[RowValues]) -> Result<Vec<i64>> {
        self.write(|conn| self.records.create(conn, ctx, rows))
    }

    pub fn write_records(&self, ctx: &ActiveContext, groups: &[(Vec<i64>, RowValues)]) -> Result<()> {
        self.write(|conn| self.records.write(conn, ctx, groups))
    }

    pub fn delete_records(&self, ctx: &ActiveContext, ids: &[i64]) -> Result<usize> {
        self.write(|conn| self.records.delete(conn, ctx, ids))
    }

    pub fn copy_records(&self, ctx: &ActiveContext, ids: &[i64]) -> Result<Vec<i64>> {
        self.write(|conn| self.records.copy(conn, ctx, ids))
    }

    pub fn update_record_formulas(&self, ctx: &ActiveContext, ids: Option<&[i64]>) -> Result<usize> {
        self.write(|conn| self.records.update_formulas(conn, ctx, ids))
    }
}
