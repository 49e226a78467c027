//! Built-in formula functions (Rust) and their metadata.
//!
//! Conventions:
//! - Formula-facing built-in names are ALL CAPS (e.g. `SUM`, `YEAR`).
//! - Variadic built-ins receive their arguments as one Rhai array; the
//!   compiler wraps the call arguments accordingly.
//! - Bad input yields `()` (null) rather than a runtime error, so a single
//!   bad row never aborts a recompute.
//! - If you add a new built-in, add it to `BUILTINS` and register its
//!   implementation in `register_builtins`.

use chrono::{Local, NaiveDate};
use rand::Rng;
use rhai::{Array, Dynamic, Engine};
use std::sync::Arc;

use crate::engine::{LookupCache, ModelReader, dynamic_to_value, value_to_dynamic};
use crate::types::{DATE_FORMAT, DATETIME_FORMAT};

pub struct Builtin {
    pub name: &'static str,
    /// Arguments are packed into a single array before the call.
    pub variadic: bool,
    pub min_args: usize,
    pub max_args: usize,
    #[allow(dead_code)]
    pub description: &'static str,
}

const fn fixed(name: &'static str, min_args: usize, max_args: usize, description: &'static str) -> Builtin {
    Builtin {
        name,
        variadic: false,
        min_args,
        max_args,
        description,
    }
}

const fn variadic(name: &'static str, min_args: usize, description: &'static str) -> Builtin {
    Builtin {
        name,
        variadic: true,
        min_args,
        max_args: usize::MAX,
        description,
    }
}

pub const BUILTINS: &[Builtin] = &[
    variadic("SUM", 1, "Sum of the numeric arguments"),
    variadic("AVERAGE", 1, "Average of the numeric arguments"),
    variadic("AVG", 1, "Alias of AVERAGE"),
    variadic("MIN", 1, "Smallest numeric argument"),
    variadic("MAX", 1, "Largest numeric argument"),
    variadic("COUNT", 1, "Number of non-null arguments"),
    variadic("CONCAT", 1, "Concatenate arguments as text"),
    variadic("AND", 1, "True when every argument is truthy"),
    variadic("OR", 1, "True when any argument is truthy"),
    variadic("COALESCE", 1, "First non-null argument"),
    fixed("IF", 2, 3, "IF(condition, then[, else])"),
    fixed("NOT", 1, 1, "Logical negation"),
    fixed("ISNULL", 1, 1, "True when the argument is null"),
    fixed("ABS", 1, 1, "Absolute value"),
    fixed("ROUND", 1, 2, "ROUND(x[, decimals]), half away from zero"),
    fixed("INT", 1, 1, "Round down to an integer"),
    fixed("FLOAT", 1, 1, "Convert to a float"),
    fixed("MOD", 2, 2, "Remainder with the sign of the divisor"),
    fixed("POW", 2, 2, "Exponentiation"),
    fixed("SQRT", 1, 1, "Square root"),
    fixed("DIV", 2, 2, "Float division, null when dividing by zero"),
    fixed("RAND", 0, 0, "Random float in [0, 1)"),
    fixed("RANDINT", 2, 2, "Random integer in [min, max]"),
    fixed("TEXT", 1, 1, "Convert to text"),
    fixed("LEN", 1, 1, "Number of characters"),
    fixed("UPPER", 1, 1, "Upper-case text"),
    fixed("LOWER", 1, 1, "Lower-case text"),
    fixed("TRIM", 1, 1, "Strip surrounding whitespace"),
    fixed("LEFT", 1, 2, "LEFT(text[, count]), leading characters"),
    fixed("RIGHT", 1, 2, "RIGHT(text[, count]), trailing characters"),
    fixed("YEAR", 1, 1, "Year part (YYYY) of a date"),
    fixed("MONTH", 1, 1, "Month part (MM) of a date"),
    fixed("DAY", 1, 1, "Day part (DD) of a date"),
    fixed("WEEK", 1, 1, "Week of the year, Monday first (00-53)"),
    fixed("YM", 1, 1, "Year and month (YYYY-MM) of a date"),
    fixed("YMD", 1, 1, "Date part (YYYY-MM-DD) of a date or datetime"),
    fixed("DATE", 1, 3, "DATE(text) or DATE(year, month, day)"),
    fixed("TODAY", 0, 0, "Current local date"),
    fixed("NOW", 0, 0, "Current local date and time"),
    fixed("SHEET_LOOKUP", 4, 4, "SHEET_LOOKUP(sheet, key_column, key, column)"),
    fixed("MODEL_LOOKUP", 3, 3, "MODEL_LOOKUP(model, id, field)"),
];

pub fn builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

fn number(value: &Dynamic) -> Option<f64> {
    if let Ok(n) = value.as_int() {
        return Some(n as f64);
    }
    if let Ok(n) = value.as_float() {
        return Some(n);
    }
    if value.is_string() {
        return value.clone().into_string().ok()?.trim().parse().ok();
    }
    None
}

fn text(value: &Dynamic) -> String {
    dynamic_to_value(value.clone()).to_string()
}

fn truthy(value: &Dynamic) -> bool {
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Ok(n) = value.as_int() {
        return n != 0;
    }
    if let Ok(n) = value.as_float() {
        return n != 0.0;
    }
    if value.is_string() {
        return !text(value).is_empty();
    }
    !value.is_unit()
}

fn float_or_null(n: f64) -> Dynamic {
    if n.is_finite() { Dynamic::from(n) } else { Dynamic::UNIT }
}

fn round_half_away(n: f64, decimals: i64) -> f64 {
    let factor = 10f64.powi(decimals.clamp(-12, 12) as i32);
    (n * factor).round() / factor
}

/// Leading `YYYY-MM-DD` of a date or datetime rendering.
fn date_part(value: &Dynamic) -> Option<NaiveDate> {
    let text = text(value);
    let head = text.get(0..10)?;
    NaiveDate::parse_from_str(head, DATE_FORMAT).ok()
}

fn date_field(value: &Dynamic, format: &str) -> Dynamic {
    date_part(value)
        .map(|d| Dynamic::from(d.format(format).to_string()))
        .unwrap_or(Dynamic::UNIT)
}

fn numeric_args(args: &Array) -> Vec<&Dynamic> {
    args.iter().filter(|a| number(a).is_some() && !a.is_string()).collect()
}

fn sum(args: &Array) -> Dynamic {
    let numeric = numeric_args(args);
    if numeric.iter().all(|a| a.as_int().is_ok()) {
        let total = numeric
            .iter()
            .filter_map(|a| a.as_int().ok())
            .try_fold(0i64, |acc, n| acc.checked_add(n));
        if let Some(total) = total {
            return Dynamic::from(total);
        }
    }
    float_or_null(numeric.iter().filter_map(|a| number(a)).sum())
}

fn average(args: &Array) -> Dynamic {
    let values: Vec<f64> = numeric_args(args).into_iter().filter_map(number).collect();
    if values.is_empty() {
        return Dynamic::UNIT;
    }
    float_or_null(values.iter().sum::<f64>() / values.len() as f64)
}

fn extreme(args: &Array, pick_greater: bool) -> Dynamic {
    let mut best: Option<(f64, &Dynamic)> = None;
    for arg in numeric_args(args) {
        let Some(n) = number(arg) else { continue };
        let replace = match best {
            None => true,
            Some((b, _)) => (pick_greater && n > b) || (!pick_greater && n < b),
        };
        if replace {
            best = Some((n, arg));
        }
    }
    best.map(|(_, d)| d.clone()).unwrap_or(Dynamic::UNIT)
}

/// Register all built-in functions into the Rhai engine.
///
/// `lookups` is shared with the host, which fills it before evaluation.
pub fn register_builtins(
    engine: &mut Engine,
    lookups: LookupCache,
    models: Option<Arc<dyn ModelReader>>,
) {
    // Aggregates

    engine.register_fn("SUM", |args: Array| -> Dynamic { sum(&args) });
    engine.register_fn("AVERAGE", |args: Array| -> Dynamic { average(&args) });
    engine.register_fn("AVG", |args: Array| -> Dynamic { average(&args) });
    engine.register_fn("MIN", |args: Array| -> Dynamic { extreme(&args, false) });
    engine.register_fn("MAX", |args: Array| -> Dynamic { extreme(&args, true) });
    engine.register_fn("COUNT", |args: Array| -> i64 {
        args.iter().filter(|a| !a.is_unit()).count() as i64
    });

    // Logic

    engine.register_fn("AND", |args: Array| -> bool { args.iter().all(truthy) });
    engine.register_fn("OR", |args: Array| -> bool { args.iter().any(truthy) });
    engine.register_fn("COALESCE", |args: Array| -> Dynamic {
        args.into_iter()
            .find(|a| !a.is_unit())
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("IF", |cond: Dynamic, then: Dynamic| -> Dynamic {
        if truthy(&cond) { then } else { Dynamic::UNIT }
    });
    engine.register_fn(
        "IF",
        |cond: Dynamic, then: Dynamic, otherwise: Dynamic| -> Dynamic {
            if truthy(&cond) { then } else { otherwise }
        },
    );
    engine.register_fn("NOT", |x: Dynamic| -> Dynamic {
        if x.is_unit() {
            Dynamic::UNIT
        } else {
            Dynamic::from(!truthy(&x))
        }
    });
    engine.register_fn("ISNULL", |x: Dynamic| -> bool { x.is_unit() });

    // Math

    engine.register_fn("ABS", |x: Dynamic| -> Dynamic {
        if let Ok(n) = x.as_int() {
            return n.checked_abs().map(Dynamic::from).unwrap_or(Dynamic::UNIT);
        }
        number(&x).map(|n| float_or_null(n.abs())).unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("ROUND", |x: Dynamic| -> Dynamic {
        if x.as_int().is_ok() {
            return x;
        }
        number(&x)
            .map(|n| float_or_null(round_half_away(n, 0)))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("ROUND", |x: Dynamic, decimals: Dynamic| -> Dynamic {
        let Some(decimals) = number(&decimals) else {
            return Dynamic::UNIT;
        };
        number(&x)
            .map(|n| float_or_null(round_half_away(n, decimals as i64)))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("INT", |x: Dynamic| -> Dynamic {
        if x.as_int().is_ok() {
            return x;
        }
        match number(&x).map(f64::floor) {
            Some(n) if n.is_finite() && n.abs() < i64::MAX as f64 => Dynamic::from(n as i64),
            _ => Dynamic::UNIT,
        }
    });
    engine.register_fn("FLOAT", |x: Dynamic| -> Dynamic {
        number(&x).map(float_or_null).unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("MOD", |a: Dynamic, b: Dynamic| -> Dynamic {
        if let (Ok(a), Ok(b)) = (a.as_int(), b.as_int()) {
            // `checked_rem` is None for a zero divisor and for MIN % -1.
            return match a.checked_rem(b) {
                Some(r) if r != 0 && (r < 0) != (b < 0) => Dynamic::from(r + b),
                Some(r) => Dynamic::from(r),
                None => Dynamic::UNIT,
            };
        }
        match (number(&a), number(&b)) {
            (Some(_), Some(b)) if b == 0.0 => Dynamic::UNIT,
            (Some(a), Some(b)) => float_or_null(a - b * (a / b).floor()),
            _ => Dynamic::UNIT,
        }
    });
    engine.register_fn("POW", |base: Dynamic, exp: Dynamic| -> Dynamic {
        match (number(&base), number(&exp)) {
            (Some(b), Some(e)) => float_or_null(b.powf(e)),
            _ => Dynamic::UNIT,
        }
    });
    engine.register_fn("SQRT", |x: Dynamic| -> Dynamic {
        number(&x).map(|n| float_or_null(n.sqrt())).unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("DIV", |a: Dynamic, b: Dynamic| -> Dynamic {
        match (number(&a), number(&b)) {
            (Some(_), Some(b)) if b == 0.0 => Dynamic::UNIT,
            (Some(a), Some(b)) => float_or_null(a / b),
            _ => Dynamic::UNIT,
        }
    });

    // RAND(): random float in [0.0, 1.0)
    engine.register_fn("RAND", || -> f64 { rand::thread_rng().r#gen() });

    // RANDINT(min, max): random integer in [min, max] inclusive
    engine.register_fn("RANDINT", |min: i64, max: i64| -> Dynamic {
        if min > max {
            return Dynamic::UNIT;
        }
        Dynamic::from(rand::thread_rng().r#gen_range(min..=max))
    });

    // Text

    engine.register_fn("CONCAT", |args: Array| -> String {
        args.iter().map(text).collect()
    });
    engine.register_fn("TEXT", |x: Dynamic| -> String { text(&x) });
    engine.register_fn("LEN", |x: Dynamic| -> i64 { text(&x).chars().count() as i64 });
    engine.register_fn("UPPER", |x: Dynamic| -> String { text(&x).to_uppercase() });
    engine.register_fn("LOWER", |x: Dynamic| -> String { text(&x).to_lowercase() });
    engine.register_fn("TRIM", |x: Dynamic| -> String { text(&x).trim().to_string() });
    engine.register_fn("LEFT", |x: Dynamic| -> String { text(&x).chars().take(1).collect() });
    engine.register_fn("LEFT", |x: Dynamic, count: i64| -> String {
        text(&x).chars().take(count.max(0) as usize).collect()
    });
    engine.register_fn("RIGHT", |x: Dynamic| -> String {
        let s = text(&x);
        s.chars().skip(s.chars().count().saturating_sub(1)).collect()
    });
    engine.register_fn("RIGHT", |x: Dynamic, count: i64| -> String {
        let s = text(&x);
        let skip = s.chars().count().saturating_sub(count.max(0) as usize);
        s.chars().skip(skip).collect()
    });

    // Dates. Arguments are ISO renderings (see `value_to_dynamic`).

    engine.register_fn("YEAR", |x: Dynamic| -> Dynamic { date_field(&x, "%Y") });
    engine.register_fn("MONTH", |x: Dynamic| -> Dynamic { date_field(&x, "%m") });
    engine.register_fn("DAY", |x: Dynamic| -> Dynamic { date_field(&x, "%d") });
    engine.register_fn("WEEK", |x: Dynamic| -> Dynamic { date_field(&x, "%W") });
    engine.register_fn("YM", |x: Dynamic| -> Dynamic { date_field(&x, "%Y-%m") });
    engine.register_fn("YMD", |x: Dynamic| -> Dynamic { date_field(&x, DATE_FORMAT) });
    engine.register_fn("DATE", |x: Dynamic| -> Dynamic { date_field(&x, DATE_FORMAT) });
    engine.register_fn("DATE", |y: i64, m: i64, d: i64| -> Dynamic {
        let (Ok(m), Ok(d)) = (u32::try_from(m), u32::try_from(d)) else {
            return Dynamic::UNIT;
        };
        i32::try_from(y)
            .ok()
            .and_then(|y| NaiveDate::from_ymd_opt(y, m, d))
            .map(|date| Dynamic::from(date.format(DATE_FORMAT).to_string()))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("TODAY", || -> String {
        Local::now().date_naive().format(DATE_FORMAT).to_string()
    });
    engine.register_fn("NOW", || -> String {
        Local::now().naive_local().format(DATETIME_FORMAT).to_string()
    });

    // Lookups

    let cache = lookups.clone();
    engine.register_fn(
        "SHEET_LOOKUP",
        move |sheet: &str, key_column: &str, key: Dynamic, column: &str| -> Dynamic {
            let key = dynamic_to_value(key);
            value_to_dynamic(&cache.find(sheet, key_column, &key, column))
        },
    );

    engine.register_fn(
        "MODEL_LOOKUP",
        move |model: &str, id: Dynamic, field: &str| -> Dynamic {
            let Some(reader) = models.as_ref() else {
                return Dynamic::UNIT;
            };
            let Some(id) = number(&id).map(|n| n as i64) else {
                return Dynamic::UNIT;
            };
            reader
                .read_field(model, id, field)
                .map(|v| value_to_dynamic(&v))
                .unwrap_or(Dynamic::UNIT)
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::collections::HashMap;

    fn engine() -> Engine {
        let mut engine = Engine::new();
        register_builtins(&mut engine, LookupCache::default(), None);
        engine
    }

    fn eval(src: &str) -> Value {
        dynamic_to_value(engine().eval::<Dynamic>(src).unwrap())
    }

    #[test]
    fn test_builtin_names_are_unique_and_uppercase() {
        let mut names: Vec<_> = BUILTINS.iter().map(|b| b.name).collect();
        assert!(names.iter().all(|n| *n == n.to_uppercase()));
        names.sort();
        names.dedup();
        assert_eq!(names.len(), BUILTINS.len());
        assert!(builtin("SUM").is_some_and(|b| b.variadic));
        assert!(builtin("sum").is_none());
    }

    #[test]
    fn test_sum_keeps_integers_and_skips_nulls() {
        assert_eq!(eval("SUM([1, 2, ()])"), Value::Integer(3));
        assert_eq!(eval("SUM([1, 2.5])"), Value::Float(3.5));
        assert_eq!(eval("AVERAGE([2, 4, ()])"), Value::Float(3.0));
        assert_eq!(eval("AVG([])"), Value::Null);
        assert_eq!(eval("COUNT([1, (), \"a\"])"), Value::Integer(2));
    }

    #[test]
    fn test_min_max_return_original_value() {
        assert_eq!(eval("MIN([3, 1.5, 7])"), Value::Float(1.5));
        assert_eq!(eval("MAX([3, 1.5, 7])"), Value::Integer(7));
        assert_eq!(eval("MAX([(), ()])"), Value::Null);
    }

    #[test]
    fn test_division_by_zero_is_null() {
        assert_eq!(eval("DIV(1, 0)"), Value::Null);
        assert_eq!(eval("DIV(7, 2)"), Value::Float(3.5));
        assert_eq!(eval("MOD(-7, 3)"), Value::Integer(2));
        assert_eq!(eval("MOD(1, 0)"), Value::Null);
        assert_eq!(eval("SQRT(-1)"), Value::Null);
    }

    #[test]
    fn test_mod_takes_divisor_sign_without_overflow() {
        assert_eq!(eval("MOD(7, -3)"), Value::Integer(-2));
        assert_eq!(eval("MOD(-6, 3)"), Value::Integer(0));
        assert_eq!(eval("MOD(-9223372036854775807 - 1, -1)"), Value::Null);
        assert_eq!(eval("MOD(9223372036854775807, -9223372036854775807 - 1)"), Value::Integer(-1));
        assert_eq!(eval("MOD(-7.5, 2)"), Value::Float(0.5));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(eval("ROUND(2.5)"), Value::Float(3.0));
        assert_eq!(eval("ROUND(-2.5)"), Value::Float(-3.0));
        assert_eq!(eval("ROUND(3.14159, 2)"), Value::Float(3.14));
        assert_eq!(eval("INT(-1.5)"), Value::Integer(-2));
        assert_eq!(eval("FLOAT(\"2.5\")"), Value::Float(2.5));
    }

    #[test]
    fn test_logic() {
        assert_eq!(eval("IF(1 > 0, \"yes\", \"no\")"), Value::Text("yes".into()));
        assert_eq!(eval("IF(false, 1)"), Value::Null);
        assert_eq!(eval("AND([true, 1, \"x\"])"), Value::Boolean(true));
        assert_eq!(eval("OR([false, 0, ()])"), Value::Boolean(false));
        assert_eq!(eval("COALESCE([(), 4])"), Value::Integer(4));
        assert_eq!(eval("ISNULL(())"), Value::Boolean(true));
        assert_eq!(eval("NOT(())"), Value::Null);
    }

    #[test]
    fn test_text_functions() {
        assert_eq!(eval("CONCAT([\"a\", 1, (), 2.0])"), Value::Text("a12.0".into()));
        assert_eq!(eval("LEN(\"héllo\")"), Value::Integer(5));
        assert_eq!(eval("LEFT(\"abcdef\", 2)"), Value::Text("ab".into()));
        assert_eq!(eval("RIGHT(\"abcdef\", 10)"), Value::Text("abcdef".into()));
        assert_eq!(eval("TRIM(\"  x \")"), Value::Text("x".into()));
    }

    #[test]
    fn test_date_parts() {
        assert_eq!(eval("YEAR(\"2023-04-05 10:00:00\")"), Value::Text("2023".into()));
        assert_eq!(eval("MONTH(\"2023-04-05\")"), Value::Text("04".into()));
        assert_eq!(eval("YM(\"2023-04-05\")"), Value::Text("2023-04".into()));
        assert_eq!(eval("WEEK(\"2023-01-09\")"), Value::Text("02".into()));
        assert_eq!(eval("DATE(2024, 2, 29)"), Value::Text("2024-02-29".into()));
        assert_eq!(eval("DATE(2023, 2, 29)"), Value::Null);
        assert_eq!(eval("YEAR(())"), Value::Null);
    }

    #[test]
    fn test_sheet_lookup_reads_cache() {
        let cache = LookupCache::default();
        let mut engine = Engine::new();
        register_builtins(&mut engine, cache.clone(), None);

        let row: HashMap<String, Value> = [
            ("code".to_string(), Value::Text("A".into())),
            ("rate".to_string(), Value::Float(0.2)),
        ]
        .into_iter()
        .collect();
        cache.insert_sheet("rates", vec![row]);

        let result = engine
            .eval::<Dynamic>(r#"SHEET_LOOKUP("rates", "code", "A", "rate")"#)
            .unwrap();
        assert_eq!(dynamic_to_value(result), Value::Float(0.2));
    }

    #[test]
    fn test_model_lookup_without_reader_is_null() {
        assert_eq!(eval(r#"MODEL_LOOKUP("party", 1, "name")"#), Value::Null);
    }
}
