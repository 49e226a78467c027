//! Formula compilation.
//!
//! A formula is text beginning with `=`. Anything else is a static value that
//! the caller coerces through the Type Catalog. Compilation parses the body,
//! checks every function call against [`BUILTINS`](crate::builtins::BUILTINS),
//! and lowers the tree to a Rhai expression that reads columns from a `row`
//! map. Spreadsheet operators that behave differently in Rhai (`/`, `^`, `&`,
//! `%`) are lowered to built-in calls.

use rhai::{AST, Engine};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use super::eval::{ROW_VAR, create_engine_with_lookups, eval_program};
use super::lookup::{LookupCache, ModelReader};
use super::parser::{BinaryOp, Expr, ParseErrorKind, UnaryOp, parse_formula};
use super::row::RowValues;
use crate::builtins::builtin;
use crate::types::Value;

/// Marker that distinguishes formulas from static values.
pub const FORMULA_MARKER: char = '=';

/// Argument positions of lookup built-ins that must be string literals.
const LITERAL_ARGS: &[(&str, &[usize])] = &[("SHEET_LOOKUP", &[0, 1, 3]), ("MODEL_LOOKUP", &[0, 2])];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompileErrorKind {
    Syntax(ParseErrorKind),
    UnknownFunctions,
    Arity,
    InvalidLookup,
    /// The lowered program was rejected by Rhai.
    Script,
    /// A script of user functions failed to load.
    FunctionScript,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileErrorKind::Syntax(kind) => write!(f, "syntax error ({})", kind),
            CompileErrorKind::UnknownFunctions => f.write_str("unknown functions"),
            CompileErrorKind::Arity => f.write_str("wrong number of arguments"),
            CompileErrorKind::InvalidLookup => f.write_str("invalid lookup"),
            CompileErrorKind::Script => f.write_str("script error"),
            CompileErrorKind::FunctionScript => f.write_str("function script error"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    /// Every unknown function name, sorted and deduplicated.
    pub functions: Vec<String>,
}

impl CompileError {
    fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            functions: Vec::new(),
        }
    }
}

/// A compiled formula, ready to evaluate against rows.
#[derive(Clone, Debug)]
pub struct Program {
    source: String,
    script: String,
    ast: AST,
    inputs: BTreeSet<String>,
    sheet_lookups: BTreeSet<String>,
}

impl Program {
    /// The formula text, including the leading `=`.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The lowered Rhai expression.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }

    /// Lower-cased column aliases the formula reads.
    pub fn inputs(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    /// Sheets referenced by `SHEET_LOOKUP`, lower-cased.
    pub fn sheet_lookups(&self) -> &BTreeSet<String> {
        &self.sheet_lookups
    }
}

#[derive(Clone, Debug)]
pub enum Compiled {
    /// Literal text, copied into every row.
    Static(String),
    Formula(Program),
}

impl Compiled {
    pub fn program(&self) -> Option<&Program> {
        match self {
            Compiled::Formula(p) => Some(p),
            Compiled::Static(_) => None,
        }
    }
}

pub fn is_formula(expression: &str) -> bool {
    expression.trim_start().starts_with(FORMULA_MARKER)
}

/// Column aliases read by `expr`, lower-cased.
pub fn inputs(expr: &Expr) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    expr.walk(&mut |node| {
        if let Expr::Column(name) = node {
            found.insert(name.to_lowercase());
        }
    });
    found
}

/// Script-defined function callable from formulas by its upper-cased name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptFunction {
    /// Name as written in the script.
    pub name: String,
    pub params: usize,
}

/// Compiles and evaluates formulas with one shared Rhai engine.
pub struct FormulaCompiler {
    engine: Engine,
    lookups: LookupCache,
    /// Function definitions merged into every program.
    functions: Option<AST>,
    script_functions: BTreeMap<String, ScriptFunction>,
}

impl Default for FormulaCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl FormulaCompiler {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A compiler whose `MODEL_LOOKUP` reads through `reader`.
    pub fn with_model_reader(reader: Arc<dyn ModelReader>) -> Self {
        Self::build(Some(reader))
    }

    fn build(models: Option<Arc<dyn ModelReader>>) -> Self {
        let lookups = LookupCache::default();
        let engine = create_engine_with_lookups(lookups.clone(), models);
        FormulaCompiler {
            engine,
            lookups,
            functions: None,
            script_functions: BTreeMap::new(),
        }
    }

    /// Rows available to `SHEET_LOOKUP`. Fill before evaluating.
    pub fn lookups(&self) -> &LookupCache {
        &self.lookups
    }

    /// Compile a Rhai script and make its functions callable from formulas.
    ///
    /// Names match case-insensitively and may not shadow a built-in. Replaces
    /// previously loaded functions; top-level statements are ignored. Returns
    /// the upper-cased names now available.
    pub fn load_functions(&mut self, script: &str) -> Result<Vec<String>, CompileError> {
        let ast = self.engine.compile(script).map_err(|e| {
            CompileError::new(CompileErrorKind::FunctionScript, format!("error in functions: {}", e))
        })?;

        let mut loaded = BTreeMap::new();
        for f in ast.iter_functions() {
            let key = f.name.to_uppercase();
            if builtin(&key).is_some() {
                return Err(CompileError::new(
                    CompileErrorKind::FunctionScript,
                    format!("{} shadows a built-in function", f.name),
                ));
            }
            let function = ScriptFunction {
                name: f.name.to_string(),
                params: f.params.len(),
            };
            if loaded.insert(key, function).is_some() {
                return Err(CompileError::new(
                    CompileErrorKind::FunctionScript,
                    format!("{} is defined more than once", f.name),
                ));
            }
        }

        self.functions = if loaded.is_empty() {
            None
        } else {
            Some(ast.clone_functions_only())
        };
        self.script_functions = loaded;
        Ok(self.script_functions.keys().cloned().collect())
    }

    /// Script functions by upper-cased name.
    pub fn script_functions(&self) -> &BTreeMap<String, ScriptFunction> {
        &self.script_functions
    }

    pub fn compile(&self, expression: &str) -> Result<Compiled, CompileError> {
        let trimmed = expression.trim_start();
        let Some(body) = trimmed.strip_prefix(FORMULA_MARKER) else {
            return Ok(Compiled::Static(expression.to_string()));
        };

        let expr = parse_formula(body)
            .map_err(|e| CompileError::new(CompileErrorKind::Syntax(e.kind), e.to_string()))?;
        check_calls(&expr, &self.script_functions)?;

        let mut script = String::new();
        Lowering {
            functions: &self.script_functions,
        }
        .lower(&expr, &mut script);
        let mut ast = self.engine.compile(&script).map_err(|e| {
            CompileError::new(CompileErrorKind::Script, format!("{} in `{}`", e, script))
        })?;
        if let Some(functions) = &self.functions {
            ast = functions.merge(&ast);
        }

        Ok(Compiled::Formula(Program {
            source: trimmed.to_string(),
            script,
            ast,
            inputs: inputs(&expr),
            sheet_lookups: sheet_lookups(&expr),
        }))
    }

    pub fn evaluate(&self, program: &Program, row: &RowValues) -> Value {
        eval_program(&self.engine, program, row)
    }
}

fn check_calls(expr: &Expr, functions: &BTreeMap<String, ScriptFunction>) -> Result<(), CompileError> {
    let mut unknown = BTreeSet::new();
    expr.walk(&mut |node| {
        if let Expr::Call { name, .. } = node
            && builtin(name).is_none()
            && !functions.contains_key(name)
        {
            unknown.insert(name.clone());
        }
    });
    if !unknown.is_empty() {
        let functions: Vec<String> = unknown.into_iter().collect();
        return Err(CompileError {
            kind: CompileErrorKind::UnknownFunctions,
            message: format!("unknown functions: {}", functions.join(", ")),
            functions,
        });
    }

    let mut failure = None;
    expr.walk(&mut |node| {
        if failure.is_some() {
            return;
        }
        if let Expr::Call { name, args } = node {
            failure = check_call(name, args, functions).err();
        }
    });
    failure.map_or(Ok(()), Err)
}

fn check_call(
    name: &str,
    args: &[Expr],
    functions: &BTreeMap<String, ScriptFunction>,
) -> Result<(), CompileError> {
    let n = args.len();
    let Some(info) = builtin(name) else {
        return match functions.get(name) {
            Some(f) if f.params != n => Err(CompileError::new(
                CompileErrorKind::Arity,
                format!("{} expects {} arguments, got {}", name, f.params, n),
            )),
            _ => Ok(()),
        };
    };
    if n < info.min_args || n > info.max_args {
        let expected = if info.variadic {
            format!("at least {}", info.min_args)
        } else if info.min_args == info.max_args {
            info.min_args.to_string()
        } else {
            format!("{} to {}", info.min_args, info.max_args)
        };
        return Err(CompileError::new(
            CompileErrorKind::Arity,
            format!("{} expects {} arguments, got {}", name, expected, n),
        ));
    }

    if let Some((_, positions)) = LITERAL_ARGS.iter().find(|(f, _)| *f == name) {
        for &i in *positions {
            if !matches!(args.get(i), Some(Expr::Text(_))) {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidLookup,
                    format!("argument {} of {} must be a quoted name", i + 1, name),
                ));
            }
        }
    }
    Ok(())
}

fn sheet_lookups(expr: &Expr) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    expr.walk(&mut |node| {
        if let Expr::Call { name, args } = node
            && name == "SHEET_LOOKUP"
            && let Some(Expr::Text(sheet)) = args.first()
        {
            found.insert(sheet.to_lowercase());
        }
    });
    found
}

fn push_string_literal(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Left-spine chains with at least this many operands lower to a block of
/// assignments, so neither Rhai's parser nor its evaluator nests per operator.
const CHAIN_BLOCK_MIN: usize = 8;

/// Accumulator of a lowered chain block.
const ACC_VAR: &str = "acc";

/// Operands of `a op b op c ...` in evaluation order: the innermost left
/// operand, then each operator with its right operand.
fn left_spine(expr: &Expr) -> (&Expr, Vec<(BinaryOp, &Expr)>) {
    let mut steps = Vec::new();
    let mut head = expr;
    while let Expr::Binary { op, lhs, rhs } = head {
        steps.push((*op, rhs.as_ref()));
        head = lhs;
    }
    steps.reverse();
    (head, steps)
}

#[derive(Clone, Copy)]
enum Operand<'a> {
    Expr(&'a Expr),
    Acc,
}

/// Emits Rhai source for a parsed formula.
struct Lowering<'a> {
    functions: &'a BTreeMap<String, ScriptFunction>,
}

impl Lowering<'_> {
    fn operand(&self, operand: Operand<'_>, out: &mut String) {
        match operand {
            Operand::Expr(expr) => self.lower(expr, out),
            Operand::Acc => out.push_str(ACC_VAR),
        }
    }

    fn call(&self, name: &str, args: &[Operand<'_>], variadic: bool, out: &mut String) {
        out.push_str(name);
        out.push('(');
        if variadic {
            out.push('[');
        }
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.operand(*arg, out);
        }
        if variadic {
            out.push(']');
        }
        out.push(')');
    }

    fn binary(&self, op: BinaryOp, lhs: Operand<'_>, rhs: Operand<'_>, out: &mut String) {
        match op {
            BinaryOp::Div => self.call("DIV", &[lhs, rhs], false, out),
            BinaryOp::Pow => self.call("POW", &[lhs, rhs], false, out),
            BinaryOp::Concat => self.call("CONCAT", &[lhs, rhs], true, out),
            _ => {
                let symbol = match op {
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    other => other.symbol(),
                };
                out.push('(');
                self.operand(lhs, out);
                out.push(' ');
                out.push_str(symbol);
                out.push(' ');
                self.operand(rhs, out);
                out.push(')');
            }
        }
    }

    /// Emit `expr` as a parenthesized Rhai expression.
    fn lower(&self, expr: &Expr, out: &mut String) {
        match expr {
            Expr::Integer(n) => {
                let _ = write!(out, "{}", n);
            }
            Expr::Float(n) => {
                let text = n.to_string();
                out.push_str(&text);
                if !text.contains('.') {
                    out.push_str(".0");
                }
            }
            Expr::Text(s) => push_string_literal(s, out),
            Expr::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Expr::Column(name) => {
                out.push_str(ROW_VAR);
                out.push('[');
                push_string_literal(name, out);
                out.push(']');
            }
            Expr::Call { name, args } => {
                let args: Vec<Operand<'_>> = args.iter().map(Operand::Expr).collect();
                match self.functions.get(name) {
                    Some(f) => self.call(&f.name, &args, false, out),
                    None => {
                        let variadic = builtin(name).is_some_and(|b| b.variadic);
                        self.call(name, &args, variadic, out);
                    }
                }
            }
            Expr::Unary { op, expr } => {
                out.push('(');
                if *op == UnaryOp::Neg {
                    out.push('-');
                }
                out.push('(');
                self.lower(expr, out);
                out.push_str("))");
            }
            Expr::Percent(inner) => {
                let hundred = Expr::Integer(100);
                self.call("DIV", &[Operand::Expr(inner.as_ref()), Operand::Expr(&hundred)], false, out);
            }
            Expr::Binary { op, lhs, rhs } => {
                let (head, steps) = left_spine(expr);
                if steps.len() + 1 < CHAIN_BLOCK_MIN {
                    self.binary(*op, Operand::Expr(lhs.as_ref()), Operand::Expr(rhs.as_ref()), out);
                    return;
                }
                let _ = write!(out, "{{ let {} = ", ACC_VAR);
                self.lower(head, out);
                out.push_str("; ");
                for (op, rhs) in steps {
                    let _ = write!(out, "{} = ", ACC_VAR);
                    self.binary(op, Operand::Acc, Operand::Expr(rhs), out);
                    out.push_str("; ");
                }
                out.push_str(ACC_VAR);
                out.push_str(" }");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn program(src: &str) -> Program {
        match FormulaCompiler::new().compile(src).unwrap() {
            Compiled::Formula(p) => p,
            Compiled::Static(s) => panic!("expected formula, got static {:?}", s),
        }
    }

    fn eval(src: &str, row: &[(&str, Value)]) -> Value {
        let compiler = FormulaCompiler::new();
        let Compiled::Formula(p) = compiler.compile(src).unwrap() else {
            panic!("expected formula");
        };
        let row: RowValues = row
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        compiler.evaluate(&p, &row)
    }

    #[test]
    fn test_static_values_are_not_compiled() {
        let compiler = FormulaCompiler::new();
        assert!(matches!(
            compiler.compile("hello").unwrap(),
            Compiled::Static(s) if s == "hello"
        ));
        assert!(is_formula("  =1"));
        assert!(!is_formula("1="));
    }

    #[test]
    fn test_lowering() {
        assert_eq!(program("=x*2").script(), r#"(row["x"] * 2)"#);
        assert_eq!(program("=a/b").script(), r#"DIV(row["a"], row["b"])"#);
        assert_eq!(program("=a&\"!\"").script(), r#"CONCAT([row["a"], "!"])"#);
        assert_eq!(program("=sum(a, 1.5)").script(), r#"SUM([row["a"], 1.5])"#);
        assert_eq!(program("=-a").script(), r#"(-(row["a"]))"#);
        assert_eq!(program("=a<>1").script(), r#"(row["a"] != 1)"#);
        assert_eq!(program("=5%").script(), "DIV(5, 100)");
        assert_eq!(program("=2^3").script(), "POW(2, 3)");
    }

    #[test]
    fn test_inputs_are_lowercased_and_unique() {
        let p = program("=Price * qty + PRICE");
        let inputs: Vec<_> = p.inputs().iter().cloned().collect();
        assert_eq!(inputs, vec!["price".to_string(), "qty".to_string()]);
    }

    #[test]
    fn test_evaluate_times_two() {
        assert_eq!(eval("=x*2", &[("x", Value::Integer(3))]), Value::Integer(6));
        assert_eq!(eval("=x*2", &[("x", Value::Float(2.5))]), Value::Float(5.0));
    }

    #[test]
    fn test_division_is_float_and_zero_is_null() {
        assert_eq!(eval("=7/2", &[]), Value::Float(3.5));
        assert_eq!(eval("=a/b", &[("a", Value::Integer(1)), ("b", Value::Integer(0))]), Value::Null);
    }

    #[test]
    fn test_runtime_faults_become_null() {
        assert_eq!(eval("=a+1", &[("a", Value::Null)]), Value::Null);
        assert_eq!(eval("=missing*2", &[]), Value::Null);
        assert_eq!(eval("=9223372036854775807+1", &[]), Value::Null);
    }

    #[test]
    fn test_concat_and_comparison() {
        assert_eq!(
            eval("=name & \" \" & n", &[("name", "a".into()), ("n", Value::Integer(2))]),
            Value::Text("a 2".to_string())
        );
        assert_eq!(eval("=IF(a >= 10, \"big\", \"small\")", &[("a", Value::Integer(12))]), Value::Text("big".into()));
        assert_eq!(eval("=a = 1", &[("a", Value::Integer(1))]), Value::Boolean(true));
    }

    #[test]
    fn test_unknown_functions_are_collected() {
        let err = FormulaCompiler::new()
            .compile("=FOO(a) + bar(1) + FOO(2) + SUM(1)")
            .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownFunctions);
        assert_eq!(err.functions, vec!["BAR".to_string(), "FOO".to_string()]);
    }

    #[test]
    fn test_syntax_error_kind() {
        let err = FormulaCompiler::new().compile("=(a + ").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax(ParseErrorKind::UnexpectedEnd));
    }

    #[test]
    fn test_arity_and_lookup_checks() {
        let compiler = FormulaCompiler::new();
        let err = compiler.compile("=ABS(1, 2)").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Arity);

        let err = compiler.compile("=SHEET_LOOKUP(s, \"k\", 1, \"v\")").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidLookup);

        let p = program("=SHEET_LOOKUP(\"Rates\", \"code\", c, \"rate\")");
        assert!(p.sheet_lookups().contains("rates"));
        assert!(p.inputs().contains("c"));
    }

    #[test]
    fn test_strings_are_escaped() {
        let p = program(r#"="a\b" & "q""uote""#);
        assert_eq!(p.script(), r#"CONCAT(["a\\b", "q\"uote"])"#);
    }

    #[test]
    fn test_long_sum_lowers_to_a_block() {
        let terms: Vec<String> = (0..120).map(|i| format!("a{}", i)).collect();
        let compiler = FormulaCompiler::new();
        let Compiled::Formula(p) = compiler.compile(&format!("={}", terms.join(" + "))).unwrap() else {
            panic!("expected formula");
        };
        assert!(p.script().starts_with(r#"{ let acc = row["a0"]; acc = (acc + row["a1"]); "#));
        assert_eq!(p.inputs().len(), 120);

        let row: RowValues = (0..120i64).map(|i| (format!("a{}", i), Value::Integer(i))).collect();
        assert_eq!(compiler.evaluate(&p, &row), Value::Integer(7140));
    }

    #[test]
    fn test_block_keeps_operator_order() {
        let row = [("a", Value::Integer(3)), ("b", Value::Integer(1)), ("c", Value::Integer(4))];
        assert_eq!(eval("=a*2+b-c/2+1+1+1+1", &row), Value::Float(9.0));
        assert_eq!(eval("=1-1-1-1-1-1-1-1-1", &[]), Value::Integer(-7));
        assert_eq!(eval("=\"x\"&1&2&3&4&5&6&7", &[]), Value::Text("x1234567".into()));
    }

    #[test]
    fn test_deeply_nested_calls_compile() {
        let src = format!("={}-3{}", "ABS(".repeat(24), ")".repeat(24));
        assert_eq!(eval(&src, &[]), Value::Integer(3));
    }

    const FUNCTIONS: &str = r#"
        fn margin(price, cost) { (price - cost) / price }
        fn spin() { loop {} }
    "#;

    #[test]
    fn test_script_functions_are_callable() {
        let mut compiler = FormulaCompiler::new();
        let names = compiler.load_functions(FUNCTIONS).unwrap();
        assert_eq!(names, vec!["MARGIN".to_string(), "SPIN".to_string()]);

        let Compiled::Formula(p) = compiler.compile("=Margin(p, c) * 100").unwrap() else {
            panic!("expected formula");
        };
        assert_eq!(p.script(), r#"(margin(row["p"], row["c"]) * 100)"#);
        let row: RowValues = [("p", Value::Float(4.0)), ("c", Value::Float(3.0))]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(compiler.evaluate(&p, &row), Value::Float(25.0));

        let err = compiler.compile("=MARGIN(p)").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Arity);
    }

    #[test]
    fn test_runaway_script_function_is_null() {
        let mut compiler = FormulaCompiler::new();
        compiler.load_functions(FUNCTIONS).unwrap();
        let Compiled::Formula(p) = compiler.compile("=SPIN()").unwrap() else {
            panic!("expected formula");
        };
        assert_eq!(compiler.evaluate(&p, &RowValues::new()), Value::Null);
    }

    #[test]
    fn test_function_script_errors() {
        let mut compiler = FormulaCompiler::new();
        let err = compiler.load_functions("fn sum(a) { a }").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::FunctionScript);
        let err = compiler.load_functions("fn broken( {").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::FunctionScript);
        assert!(compiler.script_functions().is_empty());
        assert_eq!(
            compiler.compile("=MARGIN(1, 2)").unwrap_err().kind,
            CompileErrorKind::UnknownFunctions
        );
    }
}
