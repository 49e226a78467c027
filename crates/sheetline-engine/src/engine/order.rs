//! Declaration-order checks for the formulas of one sheet.
//!
//! A formula may only read aliases declared strictly before it. Since every
//! reference points backwards, a sheet that passes this check is acyclic and
//! evaluating formulas in declaration order is always correct.

use std::collections::BTreeSet;
use std::fmt;

use super::compile::{Compiled, FormulaCompiler};

#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum Severity {
    #[default]
    None,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::None => "none",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// One formula as declared, in sheet order.
#[derive(Clone, Copy, Debug)]
pub struct Declaration<'a> {
    pub alias: &'a str,
    pub expression: Option<&'a str>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormulaCheck {
    pub alias: String,
    pub severity: Severity,
    pub message: Option<String>,
    /// Inputs that are not declared before this formula (missing or later).
    pub undeclared: Vec<String>,
}

impl FormulaCheck {
    pub fn is_ordered(&self) -> bool {
        self.undeclared.is_empty()
    }
}

/// Compile every declaration and check its inputs against earlier aliases.
///
/// Results are returned in declaration order. Static values and empty
/// expressions always pass.
pub fn check_formulas(compiler: &FormulaCompiler, declarations: &[Declaration<'_>]) -> Vec<FormulaCheck> {
    let mut declared: BTreeSet<String> = BTreeSet::new();
    let mut checks = Vec::with_capacity(declarations.len());

    for decl in declarations {
        let mut check = FormulaCheck {
            alias: decl.alias.to_string(),
            severity: Severity::None,
            message: None,
            undeclared: Vec::new(),
        };

        match decl.expression.map(|e| compiler.compile(e)) {
            None | Some(Ok(Compiled::Static(_))) => {}
            Some(Err(e)) => {
                check.severity = Severity::Error;
                check.message = Some(e.to_string());
            }
            Some(Ok(Compiled::Formula(program))) => {
                check.undeclared = program
                    .inputs()
                    .iter()
                    .filter(|input| !declared.contains(*input))
                    .cloned()
                    .collect();
                if !check.is_ordered() {
                    check.severity = Severity::Warning;
                    check.message = Some(format!(
                        "not declared before this formula: {}",
                        check.undeclared.join(", ")
                    ));
                }
            }
        }

        declared.insert(decl.alias.to_lowercase());
        checks.push(check);
    }
    checks
}
