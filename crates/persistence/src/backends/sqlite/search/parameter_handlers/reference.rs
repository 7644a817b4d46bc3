//! Reference parameter SQL handler.

use crate::search::ParsedReference;
use crate::types::{SearchModifier, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::string::escape_like;

/// Handles reference parameter SQL generation.
///
/// References are indexed in their local `Type/id` form.
pub struct ReferenceHandler;

impl ReferenceHandler {
    /// Builds SQL for a reference parameter value.
    ///
    /// Accepts `Type/id`, absolute URLs, `urn:` placeholders and bare ids.
    /// A bare id matches a reference of any type unless a `:Type` modifier
    /// names one.
    pub fn build_sql(value: &SearchValue, modifier: Option<&SearchModifier>) -> SqlFragment {
        let raw = value.value.trim();

        if let Some(parsed) = ParsedReference::parse(raw) {
            if parsed.target_type.is_some() || raw.starts_with("urn:") {
                return SqlFragment::with_params(
                    "value_reference = ?",
                    vec![SqlParam::string(parsed.local_reference())],
                );
            }
        }

        match modifier {
            Some(SearchModifier::Type(target)) => SqlFragment::with_params(
                "value_reference = ?",
                vec![SqlParam::string(format!("{}/{}", target, raw))],
            ),
            _ => SqlFragment::with_params(
                "value_reference LIKE ? ESCAPE '\\'",
                vec![SqlParam::string(format!("%/{}", escape_like(raw)))],
            ),
        }
    }
}
