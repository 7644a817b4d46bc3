//! Date parameter SQL handler.
//!
//! Both stored values and search values are ranges `[low, high)` kept as
//! fixed-width text, so comparisons are plain string comparisons.

use crate::error::SearchError;
use crate::search::DateRange;
use crate::types::{SearchPrefix, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles date parameter SQL generation.
pub struct DateHandler;

const CONTAINED: &str = "value_date_low >= ? AND value_date_high <= ?";

impl DateHandler {
    /// Builds SQL for a date parameter value.
    pub fn build_sql(value: &SearchValue) -> Result<SqlFragment, SearchError> {
        let range = DateRange::parse(&value.value).ok_or_else(|| SearchError::QueryParseError {
            message: format!("'{}' is not a valid date", value.value),
        })?;
        let low = SqlParam::string(range.low_key());
        let high = SqlParam::string(range.high_key());

        let fragment = match value.prefix {
            SearchPrefix::Eq => SqlFragment::with_params(CONTAINED, vec![low, high]),
            SearchPrefix::Ne => {
                SqlFragment::with_params(format!("NOT ({})", CONTAINED), vec![low, high])
            }
            SearchPrefix::Gt => SqlFragment::with_params("value_date_high > ?", vec![high]),
            SearchPrefix::Lt => SqlFragment::with_params("value_date_low < ?", vec![low]),
            SearchPrefix::Ge => SqlFragment::with_params(
                format!("value_date_high > ? OR ({})", CONTAINED),
                vec![high.clone(), low, high],
            ),
            SearchPrefix::Le => SqlFragment::with_params(
                format!("value_date_low < ? OR ({})", CONTAINED),
                vec![low.clone(), low, high],
            ),
            SearchPrefix::Sa => SqlFragment::with_params("value_date_low >= ?", vec![high]),
            SearchPrefix::Eb => SqlFragment::with_params("value_date_high <= ?", vec![low]),
            SearchPrefix::Ap => SqlFragment::with_params(
                "value_date_low < ? AND value_date_high > ?",
                vec![high, low],
            ),
        };
        Ok(fragment)
    }
}
