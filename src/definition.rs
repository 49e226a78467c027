//! Sheet definitions read from TOML.
//!
//! ```toml
//! name = "Items"
//! timeout = 30
//! tags = ["sales"]
//!
//! [dataset]
//! name = "Products"
//! source = "model"
//! model = "product"
//! domain = '[["x", ">", 0]]'
//!
//! [[formulas]]
//! name = "x"
//! type = "integer"
//!
//! [[formulas]]
//! name = "y"
//! type = "float"
//! expression = "=x*2"
//! ```

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use sheetline_core::{DatasetSource, Formula, NewSheet, Session};
use sheetline_engine::FieldType;

use crate::error::{CliError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SheetDefinition {
    pub name: String,
    pub alias: Option<String>,
    #[serde(default)]
    pub singleton: bool,
    pub timeout: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub dataset: Option<DatasetDefinition>,
    #[serde(default)]
    pub formulas: Vec<FormulaDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct DatasetDefinition {
    pub name: Option<String>,
    #[serde(flatten)]
    pub source: SourceDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SourceDefinition {
    Model {
        model: String,
        /// Filter as JSON text.
        #[serde(default)]
        domain: String,
        #[serde(default)]
        context: String,
        #[serde(default)]
        order: String,
    },
    /// Another sheet, by alias.
    Sheet { sheet: String },
    Sql { query: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormulaDefinition {
    pub name: String,
    pub alias: Option<String>,
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,
    pub expression: Option<String>,
    pub link_target: Option<String>,
    /// Defaults to whether the formula has a type.
    pub store: Option<bool>,
}

impl FormulaDefinition {
    fn to_formula(&self) -> Formula {
        let alias = self
            .alias
            .clone()
            .unwrap_or_else(|| sheetline_engine::engine::convert_to_symbol(&self.name));
        Formula {
            name: self.name.clone(),
            alias,
            expression: self.expression.clone(),
            field_type: self.field_type,
            link_target: self.link_target.clone(),
            store: self.store.unwrap_or(self.field_type.is_some()),
        }
    }
}

impl SheetDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CliError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn to_new_sheet(&self) -> NewSheet {
        NewSheet {
            name: self.name.clone(),
            alias: self.alias.clone(),
            singleton: self.singleton,
            timeout: self.timeout,
            dataset_id: None,
            tags: self.tags.clone(),
            formulas: self.formulas.iter().map(FormulaDefinition::to_formula).collect(),
        }
    }

    /// The dataset name and source, with sheet references resolved.
    pub fn dataset_source(&self, session: &Session) -> Result<Option<(String, DatasetSource)>> {
        let Some(dataset) = &self.dataset else {
            return Ok(None);
        };
        let source = match &dataset.source {
            SourceDefinition::Model {
                model,
                domain,
                context,
                order,
            } => DatasetSource::model(model, domain, context, order)?,
            SourceDefinition::Sheet { sheet } => DatasetSource::Sheet {
                sheet_id: session.sheet(sheet)?.id,
            },
            SourceDefinition::Sql { query } => DatasetSource::Sql { query: query.clone() },
        };
        let name = dataset.name.clone().unwrap_or_else(|| self.name.clone());
        Ok(Some((name, source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEMS: &str = r#"
name = "Line Items"
timeout = 30
tags = ["sales", "daily"]

[dataset]
source = "model"
model = "product"
domain = '[["x", ">", 0]]'

[[formulas]]
name = "x"
type = "integer"

[[formulas]]
name = "Doubled X"
type = "float"
expression = "=x*2"

[[formulas]]
name = "note"
expression = "=\"n\""
"#;

    #[test]
    fn test_parse_sheet_definition() {
        let def = SheetDefinition::parse(Path::new("items.toml"), ITEMS).unwrap();
        let new = def.to_new_sheet();
        assert_eq!(new.alias(), "line_items");
        assert_eq!(new.timeout, Some(30));
        assert_eq!(new.tags.len(), 2);

        let aliases: Vec<&str> = new.formulas.iter().map(|f| f.alias.as_str()).collect();
        assert_eq!(aliases, vec!["x", "doubled_x", "note"]);
        assert!(new.formulas[1].store);
        assert_eq!(new.formulas[1].field_type, Some(FieldType::Float));
        // Untyped formulas are not stored unless asked to.
        assert!(!new.formulas[2].store);

        let dataset = def.dataset.unwrap();
        assert!(matches!(dataset.source, SourceDefinition::Model { ref model, .. } if model == "product"));
    }

    #[test]
    fn test_sql_source_and_unknown_keys() {
        let def = SheetDefinition::parse(
            Path::new("q.toml"),
            "name = \"q\"\n[dataset]\nsource = \"sql\"\nquery = \"SELECT 1 AS one\"\n",
        )
        .unwrap();
        assert!(matches!(def.dataset.unwrap().source, SourceDefinition::Sql { .. }));

        let err = SheetDefinition::parse(Path::new("bad.toml"), "name = \"q\"\ncolour = 1\n").unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
