//! Composite parameter SQL handler.
//!
//! A composite instance is stored as one `search_index` row per component,
//! all sharing a `composite_group`. The first component is matched on the
//! outer row (alias `si`); every further component must be matched by a
//! sibling row of the same group.

use crate::error::SearchError;
use crate::types::{CompositeSearchComponent, SearchParamType, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};
use super::value_condition;

/// Handles composite parameter SQL generation.
pub struct CompositeHandler;

impl CompositeHandler {
    /// Builds SQL for a composite value such as `http://loinc.org|2339-0$gt100`.
    ///
    /// The caller must select from `search_index` under the alias `si`.
    pub fn build_sql(
        components: &[CompositeSearchComponent],
        value: &SearchValue,
    ) -> Result<SqlFragment, SearchError> {
        let parts: Vec<&str> = value.value.split('$').collect();
        if components.is_empty() || parts.len() != components.len() {
            return Err(SearchError::InvalidComposite {
                message: format!(
                    "'{}' has {} components, expected {}",
                    value.value,
                    parts.len(),
                    components.len()
                ),
            });
        }

        let mut fragment = SqlFragment::new("component_index = 0");
        for (index, (component, raw)) in components.iter().zip(&parts).enumerate() {
            let condition = Self::component_condition(component.param_type, raw)?;
            if index == 0 {
                fragment = fragment.and(condition);
                continue;
            }
            let mut params = vec![SqlParam::integer(index as i64)];
            params.extend(condition.params);
            fragment = fragment.and(SqlFragment::with_params(
                format!(
                    "EXISTS (SELECT 1 FROM search_index c \
                     WHERE c.resource_type = si.resource_type \
                     AND c.resource_id = si.resource_id \
                     AND c.param_name = si.param_name \
                     AND c.composite_group = si.composite_group \
                     AND c.component_index = ? AND ({}))",
                    condition.sql
                ),
                params,
            ));
        }
        Ok(fragment)
    }

    fn component_condition(
        param_type: SearchParamType,
        raw: &str,
    ) -> Result<SqlFragment, SearchError> {
        if raw.is_empty() {
            return Err(SearchError::InvalidComposite {
                message: "composite components may not be empty".to_string(),
            });
        }
        value_condition(param_type, &SearchValue::parse(raw, param_type), None)
    }
}
