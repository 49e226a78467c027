//! Formula engine API.
//!
//! This module provides the computation side of a sheet:
//!
//! - [`parse_formula`] - Spreadsheet expression parser producing [`Expr`]
//! - [`FormulaCompiler`] - Compile formulas into Rhai programs and evaluate them
//! - [`inputs`] - Column aliases a formula reads
//! - [`check_formulas`] - Declaration-order and compile checks for a sheet
//! - [`RowValues`] - Already-computed values of one row
//! - [`LookupCache`], [`ModelReader`] - Data reachable from lookup built-ins
//! - [`convert_to_symbol`] - Derive aliases from display names

mod compile;
mod eval;
mod lookup;
mod order;
mod parser;
mod row;
mod symbol;

pub use compile::{
    CompileError, CompileErrorKind, Compiled, FORMULA_MARKER, FormulaCompiler, Program, ScriptFunction, inputs,
    is_formula,
};
pub use eval::{create_engine, create_engine_with_lookups};
pub use lookup::{LookupCache, ModelReader, SheetRows};
pub use order::{Declaration, FormulaCheck, Severity, check_formulas};
pub use parser::{BinaryOp, Expr, ParseError, ParseErrorKind, UnaryOp, parse_formula};
pub use row::{RowValues, dynamic_to_value, value_to_dynamic};
pub use symbol::{convert_to_symbol, invalid_symbol, is_valid_symbol};

pub use rhai::{AST, Dynamic};
