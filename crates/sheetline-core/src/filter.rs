//! Generic filter language shared by record search and model datasets.
//!
//! Filters are JSON lists of `[field, operator, value]` clauses, AND-ed by
//! default. A leading `"OR"` or `"AND"` string switches the combinator of
//! that list and nested lists group:
//!
//! ```json
//! ["OR", ["state", "=", "done"], [["qty", ">", 3], ["price", "<", 10]]]
//! ```

use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as Json;
use std::fmt;

use sheetline_engine::Value;

use crate::error::{Result, SheetlineError};
use crate::sql::quote_ident;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
    ILike,
}

impl Operator {
    pub fn parse(text: &str) -> Option<Operator> {
        Some(match text.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "in" => Operator::In,
            "not in" => Operator::NotIn,
            "like" => Operator::Like,
            "ilike" => Operator::ILike,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Like => "like",
            Operator::ILike => "ilike",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    pub field: String,
    pub op: Operator,
    pub value: Json,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Clause(Clause),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::And(Vec::new())
    }
}

fn invalid(message: impl Into<String>) -> SheetlineError {
    SheetlineError::InvalidFilter(message.into())
}

impl Filter {
    /// Parse the JSON text of a filter. Blank text matches everything.
    pub fn parse(text: &str) -> Result<Filter> {
        if text.trim().is_empty() {
            return Ok(Filter::default());
        }
        let json: Json = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
        Filter::from_json(&json)
    }

    pub fn from_json(json: &Json) -> Result<Filter> {
        match json {
            Json::Null => Ok(Filter::default()),
            Json::Array(items) => parse_list(items),
            other => Err(invalid(format!("expected a list, got {}", other))),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Filter::Clause(c) => Json::Array(vec![
                Json::String(c.field.clone()),
                Json::String(c.op.as_str().to_string()),
                c.value.clone(),
            ]),
            Filter::And(items) => Json::Array(items.iter().map(Filter::to_json).collect()),
            Filter::Or(items) => {
                let mut list = vec![Json::String("OR".to_string())];
                list.extend(items.iter().map(Filter::to_json));
                Json::Array(list)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::And(items) if items.is_empty())
    }

    /// Every field the filter mentions.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Clause(c) => out.push(&c.field),
            Filter::And(items) | Filter::Or(items) => {
                items.iter().for_each(|f| f.collect_fields(out))
            }
        }
    }

    /// Translate to a SQL condition with positional parameters.
    ///
    /// `known` decides which field names are valid columns.
    pub fn to_sql(&self, known: impl Fn(&str) -> bool) -> Result<(String, Vec<SqlValue>)> {
        let mut params = Vec::new();
        let sql = self.write_sql(&known, &mut params)?;
        Ok((sql, params))
    }

    fn write_sql(&self, known: &dyn Fn(&str) -> bool, params: &mut Vec<SqlValue>) -> Result<String> {
        match self {
            Filter::And(items) | Filter::Or(items) if items.is_empty() => {
                Ok(if matches!(self, Filter::And(_)) { "1=1" } else { "0=1" }.to_string())
            }
            Filter::And(items) | Filter::Or(items) => {
                let joiner = if matches!(self, Filter::And(_)) { " AND " } else { " OR " };
                let parts = items
                    .iter()
                    .map(|f| f.write_sql(known, params))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(joiner)))
            }
            Filter::Clause(c) => clause_sql(c, known, params),
        }
    }

    /// Evaluate against an in-memory record; `get` returns `None` for unknown fields.
    pub fn matches(&self, get: &dyn Fn(&str) -> Option<Value>) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|f| f.matches(get)),
            Filter::Or(items) => items.iter().any(|f| f.matches(get)),
            Filter::Clause(c) => {
                let value = get(&c.field).unwrap_or(Value::Null);
                clause_matches(c, &value)
            }
        }
    }
}

fn parse_list(items: &[Json]) -> Result<Filter> {
    if is_clause(items) {
        return parse_clause(items).map(Filter::Clause);
    }
    let (or, rest) = match items.first() {
        Some(Json::String(s)) if s.eq_ignore_ascii_case("or") => (true, &items[1..]),
        Some(Json::String(s)) if s.eq_ignore_ascii_case("and") => (false, &items[1..]),
        _ => (false, items),
    };
    let children = rest
        .iter()
        .map(|item| match item {
            Json::Array(inner) => parse_list(inner),
            other => Err(invalid(format!("expected a clause, got {}", other))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(if or { Filter::Or(children) } else { Filter::And(children) })
}

fn is_clause(items: &[Json]) -> bool {
    items.len() == 3
        && matches!(&items[0], Json::String(s) if !s.eq_ignore_ascii_case("or") && !s.eq_ignore_ascii_case("and"))
        && matches!(items[1], Json::String(_))
}

fn parse_clause(items: &[Json]) -> Result<Clause> {
    let (Json::String(field), Json::String(op)) = (&items[0], &items[1]) else {
        return Err(invalid("clause must be [field, operator, value]"));
    };
    let op = Operator::parse(op).ok_or_else(|| invalid(format!("unknown operator \"{}\"", op)))?;
    let value = items[2].clone();
    match (op, &value) {
        (Operator::In | Operator::NotIn, Json::Array(list)) => {
            if let Some(bad) = list.iter().find(|v| !is_scalar(v)) {
                return Err(invalid(format!("\"{}\" list holds a non-scalar: {}", op, bad)));
            }
        }
        (Operator::In | Operator::NotIn, other) => {
            return Err(invalid(format!("\"{}\" expects a list, got {}", op, other)));
        }
        (Operator::Like | Operator::ILike, Json::String(_)) => {}
        (Operator::Like | Operator::ILike, other) => {
            return Err(invalid(format!("\"{}\" expects a pattern, got {}", op, other)));
        }
        (_, v) if !is_scalar(v) => {
            return Err(invalid(format!("\"{}\" expects a scalar, got {}", op, v)));
        }
        _ => {}
    }
    Ok(Clause {
        field: field.clone(),
        op,
        value,
    })
}

fn is_scalar(value: &Json) -> bool {
    !matches!(value, Json::Array(_) | Json::Object(_))
}

/// JSON scalar as a bound SQL parameter.
pub fn json_to_sql(value: &Json) -> SqlValue {
    match value {
        Json::Null => SqlValue::Null,
        Json::Bool(b) => SqlValue::Integer(*b as i64),
        Json::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// JSON scalar as a sheet value.
pub fn json_to_value(value: &Json) -> Value {
    match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn clause_sql(c: &Clause, known: &dyn Fn(&str) -> bool, params: &mut Vec<SqlValue>) -> Result<String> {
    if !known(&c.field) {
        return Err(invalid(format!("unknown field \"{}\"", c.field)));
    }
    let column = quote_ident(&c.field);
    let sql = match (c.op, &c.value) {
        (Operator::Eq, Json::Null) => format!("{} IS NULL", column),
        (Operator::Ne, Json::Null) => format!("{} IS NOT NULL", column),
        (Operator::In | Operator::NotIn, Json::Array(list)) => {
            if list.is_empty() {
                return Ok(if c.op == Operator::In { "0=1" } else { "1=1" }.to_string());
            }
            params.extend(list.iter().map(json_to_sql));
            let keyword = if c.op == Operator::In { "IN" } else { "NOT IN" };
            format!("{} {} ({})", column, keyword, crate::sql::placeholders(list.len()))
        }
        (Operator::ILike, v) => {
            params.push(json_to_sql(v));
            format!("LOWER({}) LIKE LOWER(?)", column)
        }
        (op, v) => {
            params.push(json_to_sql(v));
            let sql_op = match op {
                Operator::Ne => "!=",
                Operator::Like => "LIKE",
                other => other.as_str(),
            };
            format!("{} {} ?", column, sql_op)
        }
    };
    Ok(sql)
}

fn clause_matches(c: &Clause, value: &Value) -> bool {
    match c.op {
        Operator::Eq => equal(value, &json_to_value(&c.value)),
        Operator::Ne => !equal(value, &json_to_value(&c.value)),
        Operator::In | Operator::NotIn => {
            let found = match &c.value {
                Json::Array(list) => list.iter().any(|v| equal(value, &json_to_value(v))),
                _ => false,
            };
            found == (c.op == Operator::In)
        }
        Operator::Like | Operator::ILike => match (&c.value, value) {
            (Json::String(pattern), v) if !v.is_null() => like_regex(pattern, c.op == Operator::ILike)
                .is_some_and(|re| re.is_match(&v.to_string())),
            _ => false,
        },
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            let Some(ordering) = compare_values(value, &json_to_value(&c.value)) else {
                return false;
            };
            match c.op {
                Operator::Lt => ordering.is_lt(),
                Operator::Le => ordering.is_le(),
                Operator::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => compare_values(a, b).is_some_and(|o| o.is_eq()),
    }
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Integer(_) | Value::Float(_) | Value::Boolean(_), _)
        | (_, Value::Integer(_) | Value::Float(_) | Value::Boolean(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        _ => Some(a.to_string().cmp(&b.to_string())),
    }
}

/// Compile a SQL `LIKE` pattern (`%`, `_`) into an anchored regex.
fn like_regex(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    let mut re = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// One ordering term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        OrderBy {
            field: field.to_string(),
            descending: false,
        }
    }
}

/// Parse `[[field, "ASC"|"DESC"], ...]`. Blank text is the empty ordering.
pub fn parse_order(text: &str) -> Result<Vec<OrderBy>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let json: Json = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
    order_from_json(&json)
}

pub fn order_from_json(json: &Json) -> Result<Vec<OrderBy>> {
    let Json::Array(terms) = json else {
        return Err(invalid(format!("order must be a list, got {}", json)));
    };
    terms
        .iter()
        .map(|term| match term.as_array().map(Vec::as_slice) {
            Some([Json::String(field)]) => Ok(OrderBy::asc(field)),
            Some([Json::String(field), Json::String(dir)]) => {
                let descending = match dir.to_ascii_uppercase().as_str() {
                    "ASC" => false,
                    "DESC" => true,
                    _ => return Err(invalid(format!("unknown direction \"{}\"", dir))),
                };
                Ok(OrderBy {
                    field: field.clone(),
                    descending,
                })
            }
            _ => Err(invalid(format!("bad order term {}", term))),
        })
        .collect()
}

pub fn order_to_json(order: &[OrderBy]) -> Json {
    Json::Array(
        order
            .iter()
            .map(|o| {
                Json::Array(vec![
                    Json::String(o.field.clone()),
                    Json::String(if o.descending { "DESC" } else { "ASC" }.to_string()),
                ])
            })
            .collect(),
    )
}

/// `ORDER BY` body for `order`, defaulting to ascending id.
pub fn order_sql(order: &[OrderBy], known: impl Fn(&str) -> bool) -> Result<String> {
    if order.is_empty() {
        return Ok("\"id\" ASC".to_string());
    }
    let terms = order
        .iter()
        .map(|o| {
            if !known(&o.field) {
                return Err(invalid(format!("unknown order field \"{}\"", o.field)));
            }
            Ok(format!(
                "{} {}",
                quote_ident(&o.field),
                if o.descending { "DESC" } else { "ASC" }
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(terms.join(", "))
}
