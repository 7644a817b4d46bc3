//! URI parameter SQL handler.

use crate::types::SearchValue;

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles URI parameter SQL generation. URIs match exactly.
pub struct UriHandler;

impl UriHandler {
    /// Builds SQL for a URI parameter value.
    pub fn build_sql(value: &SearchValue) -> SqlFragment {
        SqlFragment::with_params("value_uri = ?", vec![SqlParam::string(&value.value)])
    }
}
