//! sheetline-engine - field types and the formula engine.
//!
//! Storage-agnostic: values come in as [`RowValues`](engine::RowValues) and
//! leave as [`Value`](types::Value). The core crate decides where they live.

pub mod builtins;
pub mod engine;
pub mod types;

pub use engine::{CompileError, Compiled, FormulaCompiler, Program, RowValues};
pub use types::{FieldType, Value};
