//! Sheet lifecycle: checking, activating, computing and reverting sheets.

use rusqlite::Connection;
use std::sync::Arc;

use sheetline_engine::FormulaCompiler;
use sheetline_engine::engine::{FormulaCheck, Severity, check_formulas};

use crate::dataset::{Datasets, field_alias, load_dataset};
use crate::error::{Result, SheetlineError};
use crate::pipeline::{ComputePipeline, ComputeReport};
use crate::schema::{CopyReport, NewTable, SchemaRegistry, Table, TableField, TableView, is_system_column, plan_copy};
use crate::sheet::{Formula, Sheet, SheetState, Warnings, replace_formulas, save_binding, validate_alias, validate_formulas};

#[derive(Clone, Debug)]
pub struct ActivationReport {
    pub table: Table,
    /// Set when rows were migrated from the previous revision.
    pub copy: Option<CopyReport>,
    /// Set when the sheet has a dataset.
    pub compute: Option<ComputeReport>,
}

/// Drives sheets through their states. Components are injected at construction.
pub struct SheetManager {
    registry: Arc<SchemaRegistry>,
    datasets: Arc<Datasets>,
    compiler: Arc<FormulaCompiler>,
    pipeline: ComputePipeline,
    user_id: i64,
}

impl SheetManager {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        datasets: Arc<Datasets>,
        compiler: Arc<FormulaCompiler>,
        user_id: i64,
    ) -> Self {
        let pipeline = ComputePipeline::new(registry.clone(), datasets.clone(), compiler.clone());
        SheetManager {
            registry,
            datasets,
            compiler,
            pipeline,
            user_id,
        }
    }

    /// Severity of every formula, in sheet order.
    pub fn check(&self, sheet: &Sheet) -> Vec<FormulaCheck> {
        check_formulas(&self.compiler, &sheet.declarations())
    }

    /// Everything activation requires of the definition.
    pub fn validate(&self, sheet: &Sheet) -> Result<()> {
        validate_alias(&sheet.name, &sheet.alias)?;
        validate_formulas(&sheet.formulas)?;
        let failing: Vec<FormulaCheck> = self
            .check(sheet)
            .into_iter()
            .filter(|c| c.severity == Severity::Error || !c.is_ordered())
            .collect();
        if failing.is_empty() {
            Ok(())
        } else {
            Err(SheetlineError::FormulaErrors(failing))
        }
    }

    /// Provision a new revision and bind it.
    ///
    /// Data from the previous revision is migrated when there is any; losing
    /// columns on the way needs the `<alias>.copy_from` warning acknowledged.
    pub fn activate(&self, conn: &Connection, sheet: &mut Sheet, warnings: &Warnings) -> Result<ActivationReport> {
        let _span = tracing::info_span!("activate", sheet = %sheet.alias).entered();
        let state = sheet.state.transition(SheetState::Active)?;
        self.validate(sheet)?;

        let fields: Vec<TableField> = sheet
            .formulas
            .iter()
            .filter(|f| f.field_type.is_some())
            .map(Formula::to_field)
            .collect();

        // Decide on migration before anything is written.
        let previous = match sheet.current_table {
            Some(id) => {
                let table = self.registry.table(conn, id)?;
                (self.registry.count(conn, &table)? > 0).then_some(table)
            }
            None => None,
        };
        if let Some(previous) = &previous {
            let plan = plan_copy(&previous.fields, &fields);
            if plan.has_losses() {
                let key = format!("{}.copy_from", sheet.alias);
                warnings.check(&key, || plan.loss_message(&previous.name, &sheet.table_name(sheet.revision + 1)))?;
            }
        }

        sheet.revision += 1;
        let stored: Vec<&str> = fields.iter().filter(|f| f.is_column()).map(|f| f.name.as_str()).collect();
        let table = self.registry.register(
            conn,
            &NewTable {
                name: sheet.data_table_name(),
                singleton: sheet.singleton,
                fields: fields.clone(),
                views: vec![TableView {
                    view_type: "table".to_string(),
                    system: true,
                    field_names: Some(stored.join(",")),
                    ..Default::default()
                }],
            },
        )?;

        let copy = match &previous {
            Some(previous) => Some(self.registry.copy_from(conn, &table, previous)?),
            None => None,
        };

        sheet.current_table = Some(table.id);
        sheet.state = state;
        save_binding(conn, sheet)?;
        tracing::info!(table = %table.name, revision = sheet.revision, "activated");

        let compute = if sheet.dataset_id.is_some() {
            Some(self.pipeline.compute_sheet(conn, sheet, self.user_id)?)
        } else {
            None
        };
        Ok(ActivationReport { table, copy, compute })
    }

    /// Back to draft so the definition can change. The table stays bound.
    pub fn draft(&self, conn: &Connection, sheet: &mut Sheet) -> Result<()> {
        sheet.state = sheet.state.transition(SheetState::Draft)?;
        save_binding(conn, sheet)
    }

    pub fn cancel(&self, conn: &Connection, sheet: &mut Sheet) -> Result<()> {
        sheet.state = sheet.state.transition(SheetState::Canceled)?;
        save_binding(conn, sheet)
    }

    /// Rebuild the current table from the dataset.
    pub fn compute(&self, conn: &Connection, sheet: &Sheet) -> Result<ComputeReport> {
        if sheet.state != SheetState::Active {
            return Err(SheetlineError::NotActive(sheet.alias.clone()));
        }
        self.pipeline.compute_sheet(conn, sheet, self.user_id)
    }

    /// Append a direct formula for each dataset field the sheet lacks.
    /// Returns how many were added.
    pub fn update_formulas(&self, conn: &Connection, sheet: &mut Sheet) -> Result<usize> {
        let Some(dataset_id) = sheet.dataset_id else {
            return Ok(0);
        };
        let dataset = load_dataset(conn, dataset_id)?;
        let mut formulas = sheet.formulas.clone();
        let mut added = 0;
        for field in self.datasets.get_fields(conn, &dataset)? {
            let alias = field_alias(&field.alias);
            if is_system_column(&alias) || formulas.iter().any(|f| f.alias == alias) {
                continue;
            }
            formulas.push(Formula {
                name: field.name,
                alias,
                expression: None,
                field_type: field.field_type,
                link_target: field.link_target,
                store: field.field_type.is_some(),
            });
            added += 1;
        }
        if added > 0 {
            replace_formulas(conn, sheet, formulas)?;
        }
        Ok(added)
    }
}
