//! Number parameter SQL handler.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::SearchError;
use crate::search::converters::{implied_range, parse_decimal};
use crate::types::{SearchPrefix, SearchValue};

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles number parameter SQL generation.
pub struct NumberHandler;

impl NumberHandler {
    /// Builds SQL for a number parameter value.
    pub fn build_sql(value: &SearchValue) -> Result<SqlFragment, SearchError> {
        let number = parse_number(&value.value)?;
        Ok(Self::compare("value_number", value.prefix, number))
    }

    /// Compares a numeric column against a value.
    ///
    /// Equality honours the precision of the search value: `100` matches
    /// anything in `[99.5, 100.5)`. `ap` allows 10% either way.
    pub fn compare(column: &str, prefix: SearchPrefix, number: Decimal) -> SqlFragment {
        let as_param = |d: Decimal| SqlParam::float(d.to_f64().unwrap_or_default());
        let (low, high) = implied_range(number);

        match prefix {
            SearchPrefix::Eq => SqlFragment::with_params(
                format!("{0} >= ? AND {0} < ?", column),
                vec![as_param(low), as_param(high)],
            ),
            SearchPrefix::Ne => SqlFragment::with_params(
                format!("NOT ({0} >= ? AND {0} < ?)", column),
                vec![as_param(low), as_param(high)],
            ),
            SearchPrefix::Gt | SearchPrefix::Sa => {
                SqlFragment::with_params(format!("{} > ?", column), vec![as_param(number)])
            }
            SearchPrefix::Lt | SearchPrefix::Eb => {
                SqlFragment::with_params(format!("{} < ?", column), vec![as_param(number)])
            }
            SearchPrefix::Ge => {
                SqlFragment::with_params(format!("{} >= ?", column), vec![as_param(number)])
            }
            SearchPrefix::Le => {
                SqlFragment::with_params(format!("{} <= ?", column), vec![as_param(number)])
            }
            SearchPrefix::Ap => {
                let margin = (number * Decimal::new(1, 1)).abs();
                SqlFragment::with_params(
                    format!("{0} >= ? AND {0} <= ?", column),
                    vec![as_param(number - margin), as_param(number + margin)],
                )
            }
        }
    }
}

pub(super) fn parse_number(raw: &str) -> Result<Decimal, SearchError> {
    parse_decimal(raw).ok_or_else(|| SearchError::QueryParseError {
        message: format!("'{}' is not a number", raw),
    })
}
