//! Error types for the Sheetline command line

use std::path::PathBuf;
use thiserror::Error;

use sheetline_core::SheetlineError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Sheetline(#[from] SheetlineError),
}

pub type Result<T> = std::result::Result<T, CliError>;
