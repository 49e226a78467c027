//! Runtime configuration.

use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_TIMEOUT: u64 = 60;
pub const DEFAULT_CACHE_SIZE: usize = 2000;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Compute timeout in seconds given to new sheets. Zero disables it.
    pub default_timeout: u64,
    /// Records fetched per page from model datasets.
    pub cache_size: usize,
    /// User recorded in the audit columns.
    pub user_id: i64,
    /// Rhai scripts whose functions formulas may call.
    pub functions: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_timeout: DEFAULT_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
            user_id: 0,
            functions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"cache_size": 10}"#).unwrap();
        assert_eq!(config.cache_size, 10);
        assert_eq!(config.default_timeout, DEFAULT_TIMEOUT);
    }
}
