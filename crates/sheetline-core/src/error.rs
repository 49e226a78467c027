//! Error types for Sheetline core.

use thiserror::Error;

use sheetline_engine::engine::{CompileError, FormulaCheck};

use crate::sheet::SheetState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while defining, materializing or querying sheets.
#[derive(Error, Debug)]
pub enum SheetlineError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Formula error: {0}")]
    Compile(#[from] CompileError),

    #[error("Model provider error: {0}")]
    Provider(#[source] BoxError),

    #[error("No model provider configured")]
    NoModelProvider,

    #[error("Invalid alias \"{name}\": character '{symbol}' is not allowed")]
    InvalidAlias { symbol: char, name: String },

    #[error("Alias \"{alias}\" is reserved")]
    ReservedAlias { alias: String },

    #[error("Formula \"{name}\" is stored but has no type")]
    InvalidStore { name: String },

    #[error("Alias \"{alias}\" is used by more than one formula")]
    DuplicateAlias { alias: String },

    #[error("Formula \"{name}\" is a link but has no target model")]
    MissingLinkTarget { name: String },

    #[error("Timeout of {0} seconds is too large")]
    InvalidTimeout(u64),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Unknown view type: {0}")]
    InvalidViewType(String),

    #[error("Cannot move sheet from {from} to {to}")]
    InvalidTransition { from: SheetState, to: SheetState },

    #[error("Sheet \"{0}\" must be in draft to change its definition")]
    NotDraft(String),

    #[error("Sheet \"{0}\" is not active")]
    NotActive(String),

    #[error("{} formula(s) prevent activation", .0.len())]
    FormulaErrors(Vec<FormulaCheck>),

    #[error("Computing sheet \"{sheet}\" took longer than {seconds} seconds")]
    Timeout { sheet: String, seconds: u64 },

    /// Recoverable; retry with `key` acknowledged to proceed.
    #[error("{message}")]
    UserWarning { key: String, message: String },

    #[error("Sheet \"{0}\" is a singleton and already holds a row")]
    SingletonFull(String),

    #[error("Table {0} is the current table of a sheet")]
    TableInUse(i64),

    #[error("No active table")]
    NoActiveTable,

    #[error("Unknown sheet: {0}")]
    UnknownSheet(String),

    #[error("Unknown table: {0}")]
    UnknownTable(i64),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(i64),

    #[error("Unknown view: {0}")]
    UnknownView(i64),

    #[error("Unknown field: {0}")]
    UnknownField(String),
}

impl SheetlineError {
    pub fn provider(e: impl Into<BoxError>) -> Self {
        SheetlineError::Provider(e.into())
    }

    /// Whether the operation may be retried once the user accepts it.
    pub fn is_warning(&self) -> bool {
        matches!(self, SheetlineError::UserWarning { .. })
    }
}

pub type Result<T> = std::result::Result<T, SheetlineError>;
