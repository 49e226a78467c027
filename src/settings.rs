//! Locating and reading `config.toml` and the default database.

use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

use sheetline_core::Config;

use crate::error::{CliError, Result};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "sheetline")
}

/// `config.toml` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    let mut path = project_dirs()?.config_dir().to_path_buf();
    path.push("config.toml");
    Some(path)
}

/// `sheetline.db` in the platform data directory.
pub fn default_db_path() -> Option<PathBuf> {
    let mut path = project_dirs()?.data_dir().to_path_buf();
    path.push("sheetline.db");
    Some(path)
}

/// Read the config. An explicit path must exist; the default one may not.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(Config::default()),
        },
    };
    let content = fs::read_to_string(&path)?;
    let mut config = parse_config(&path, &content)?;
    if let Some(base) = path.parent() {
        resolve_functions(&mut config, base);
    }
    Ok(config)
}

/// Function scripts named in the config are relative to the config file.
fn resolve_functions(config: &mut Config, base: &Path) {
    for path in &mut config.functions {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
}

fn parse_config(path: &Path, content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| CliError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = parse_config(Path::new("config.toml"), "default_timeout = 5\n").unwrap();
        assert_eq!(config.default_timeout, 5);
        assert_eq!(config.cache_size, Config::default().cache_size);
        assert_eq!(parse_config(Path::new("c"), "").unwrap(), Config::default());
    }

    #[test]
    fn test_function_scripts_resolve_against_config_dir() {
        let mut config =
            parse_config(Path::new("c"), "functions = [\"lib.rhai\", \"/abs/more.rhai\"]\n").unwrap();
        resolve_functions(&mut config, Path::new("/etc/sheetline"));
        assert_eq!(
            config.functions,
            vec![PathBuf::from("/etc/sheetline/lib.rhai"), PathBuf::from("/abs/more.rhai")]
        );
    }

    #[test]
    fn test_bad_config_names_the_file() {
        let err = parse_config(Path::new("broken.toml"), "cache_size = \"many\"").unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
