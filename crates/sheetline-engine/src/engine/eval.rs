//! Rhai engine creation and program evaluation.
//!
//! Creates the Rhai scripting engine with all formula built-in functions
//! registered and runs compiled programs against one row of values.

use rhai::{Dynamic, Engine, Scope};
use std::sync::Arc;

use super::compile::Program;
use super::lookup::{LookupCache, ModelReader};
use super::row::{RowValues, dynamic_to_value};
use crate::types::Value;

/// Name of the scope constant holding the current row.
pub(crate) const ROW_VAR: &str = "row";

/// Nesting allowed in formulas and in script functions.
pub const MAX_EXPR_DEPTH: usize = 256;

/// Operations one evaluation may run before it faults to null.
pub const MAX_OPERATIONS: u64 = 1_000_000;

/// Create a Rhai engine with built-ins registered.
pub fn create_engine() -> Engine {
    create_engine_with_lookups(LookupCache::default(), None)
}

/// Create a Rhai engine with built-ins registered and a shared lookup cache.
pub fn create_engine_with_lookups(
    lookups: LookupCache,
    models: Option<Arc<dyn ModelReader>>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.set_max_operations(MAX_OPERATIONS);
    crate::builtins::register_builtins(&mut engine, lookups, models);
    engine
}

/// Evaluate a compiled program against `row`.
///
/// Runtime faults (type mismatches, overflow, missing functions for a given
/// argument type) are not errors here: they produce [`Value::Null`].
pub fn eval_program(engine: &Engine, program: &Program, row: &RowValues) -> Value {
    let mut scope = Scope::new();
    scope.push_constant(ROW_VAR, row.to_map());
    match engine.eval_ast_with_scope::<Dynamic>(&mut scope, program.ast()) {
        Ok(value) => dynamic_to_value(value),
        Err(e) => {
            tracing::trace!(formula = program.source(), error = %e, "evaluation fault, using null");
            Value::Null
        }
    }
}
