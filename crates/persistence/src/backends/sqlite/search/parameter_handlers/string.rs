//! String parameter SQL handler.

use crate::search::converters::normalize_string;
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles string parameter SQL generation.
pub struct StringHandler;

impl StringHandler {
    /// Builds SQL for a string parameter value.
    ///
    /// Default behavior is a case- and whitespace-insensitive prefix match
    /// against the normalized column.
    pub fn build_sql(value: &SearchValue, modifier: Option<&SearchModifier>) -> SqlFragment {
        match modifier {
            Some(SearchModifier::Exact) => SqlFragment::with_params(
                "value_string_exact = ?",
                vec![SqlParam::string(&value.value)],
            ),
            Some(SearchModifier::Contains) => SqlFragment::with_params(
                "value_string LIKE ? ESCAPE '\\'",
                vec![SqlParam::string(format!(
                    "%{}%",
                    escape_like(&normalize_string(&value.value))
                ))],
            ),
            _ => SqlFragment::with_params(
                "value_string LIKE ? ESCAPE '\\'",
                vec![SqlParam::string(format!(
                    "{}%",
                    escape_like(&normalize_string(&value.value))
                ))],
            ),
        }
    }
}

/// Escapes `LIKE` wildcards so they match literally.
pub fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
