//! sheetline-core - sheet definitions, dynamic tables and the compute pipeline.
//!
//! Everything persists in one SQLite database. [`Session`] is the usual entry
//! point; the components it wires together are public for hosts that manage
//! their own transactions.

pub mod config;
pub mod dataset;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod metadata;
pub mod pipeline;
pub mod provider;
pub mod records;
pub mod schema;
pub mod session;
pub mod sheet;
pub mod sql;
pub mod view;

pub use config::Config;
pub use dataset::{Dataset, DatasetSource, Datasets, ModelField, ModelProvider, ModelQuery, Record};
pub use error::{Result, SheetlineError};
pub use filter::{Filter, OrderBy};
pub use lifecycle::{ActivationReport, SheetManager};
pub use pipeline::{ComputeReport, ComputeState};
pub use provider::MemoryProvider;
pub use records::{ActiveContext, RecordAccess, TableRow};
pub use schema::{CopyReport, SchemaRegistry, Table, TableField};
pub use session::Session;
pub use sheet::{Formula, NewSheet, Sheet, SheetState, Warnings};
pub use view::View;

pub use sheetline_engine::{FieldType, RowValues, Value};
