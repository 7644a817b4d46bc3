//! Token parameter SQL handler.

use crate::types::SearchValue;

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles token parameter SQL generation.
///
/// `:not` is applied by the query builder around the whole parameter, so
/// this handler only ever builds positive matches.
pub struct TokenHandler;

impl TokenHandler {
    /// Builds SQL for a token parameter value.
    ///
    /// Token values can be:
    /// - `code` - matches any system
    /// - `system|code` - matches specific system and code
    /// - `|code` - matches code with no system
    /// - `system|` - matches any code in system
    pub fn build_sql(value: &SearchValue) -> SqlFragment {
        match value.value.split_once('|') {
            None => SqlFragment::with_params(
                "value_token_code = ?",
                vec![SqlParam::string(&value.value)],
            ),
            Some(("", code)) => SqlFragment::with_params(
                "(value_token_system IS NULL OR value_token_system = '') AND value_token_code = ?",
                vec![SqlParam::string(code)],
            ),
            Some((system, "")) => SqlFragment::with_params(
                "value_token_system = ?",
                vec![SqlParam::string(system)],
            ),
            Some((system, code)) => SqlFragment::with_params(
                "value_token_system = ? AND value_token_code = ?",
                vec![SqlParam::string(system), SqlParam::string(code)],
            ),
        }
    }
}
