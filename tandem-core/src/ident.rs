//! Identifier validation for SQL table names and document collections.

use regex::Regex;
use std::sync::OnceLock;

fn sql_ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"))
}

fn collection_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,62}$").expect("valid regex"))
}

/// Returns `true` for names usable as an unquoted Postgres identifier.
pub fn is_safe_sql_identifier(name: &str) -> bool {
    sql_ident_pattern().is_match(name)
}

/// Returns `true` for names accepted as document collection identifiers.
pub fn is_safe_collection(name: &str) -> bool {
    collection_pattern().is_match(name)
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Validates `table` or `schema.table` and returns the quoted, qualified form.
pub fn qualified_table(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return None;
    }
    if !parts.iter().all(|p| is_safe_sql_identifier(p)) {
        return None;
    }
    Some(
        parts
            .iter()
            .map(|p| quote_ident(p))
            .collect::<Vec<_>>()
            .join("."),
    )
}

/// Sanitized form of a table name for deriving index names.
pub fn index_prefix(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}
