//! Alias symbols for sheets and formulas.
//!
//! An alias is what formulas use to reference a column and what the
//! physical table uses as a column name. It must match `[a-z_][a-z0-9_]*`.

use regex::Regex;
use std::sync::OnceLock;

const VALID_FIRST_SYMBOLS: &str = "abcdefghijklmnopqrstuvwxyz";
const VALID_NEXT_SYMBOLS: &str = "_0123456789";

fn is_first_symbol(c: char) -> bool {
    VALID_FIRST_SYMBOLS.contains(c)
}

fn is_symbol(c: char) -> bool {
    is_first_symbol(c) || VALID_NEXT_SYMBOLS.contains(c)
}

fn symbol_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("symbol regex must compile"))
}

/// Derive a usable alias from a display name.
///
/// - empty input becomes `x`
/// - the text is lower-cased
/// - a leading character that is not a letter is replaced by `_`, and kept
///   after it when it is otherwise a valid symbol character (`"1st"` -> `"_1st"`)
/// - any later run of invalid characters collapses into a single `_`
pub fn convert_to_symbol(text: &str) -> String {
    let text = text.to_lowercase();
    let mut chars = text.chars();
    let Some(first) = chars.next() else {
        return "x".to_string();
    };

    let mut symbol = String::with_capacity(text.len() + 1);
    if is_first_symbol(first) {
        symbol.push(first);
    } else {
        symbol.push('_');
        if is_symbol(first) && first != '_' {
            symbol.push(first);
        }
    }

    for c in chars {
        if is_symbol(c) {
            symbol.push(c);
        } else if !symbol.ends_with('_') {
            symbol.push('_');
        }
    }
    symbol
}

/// Return the first character of `alias` that is not allowed, if any.
pub fn invalid_symbol(alias: &str) -> Option<char> {
    if symbol_re().is_match(alias) {
        return None;
    }
    let mut chars = alias.chars();
    match chars.next() {
        None => Some(' '),
        Some(c) if !(is_first_symbol(c) || c == '_') => Some(c),
        Some(_) => chars.find(|c| !is_symbol(*c)),
    }
}

pub fn is_valid_symbol(alias: &str) -> bool {
    symbol_re().is_match(alias)
}
