//! Parameter-specific SQL handlers.
//!
//! Each handler turns one search value into a condition over the columns of
//! a single `search_index` row. The conditions use unqualified column names
//! so they can be embedded under any alias.

mod composite;
mod date;
mod number;
mod quantity;
mod reference;
mod string;
mod token;
mod uri;

pub use composite::CompositeHandler;
pub use date::DateHandler;
pub use number::NumberHandler;
pub use quantity::QuantityHandler;
pub use reference::ReferenceHandler;
pub use string::StringHandler;
pub use token::TokenHandler;
pub use uri::UriHandler;

use crate::error::SearchError;
use crate::types::{SearchModifier, SearchParamType, SearchValue};

use super::query_builder::SqlFragment;

/// Builds the row condition for one value of a non-composite parameter.
pub fn value_condition(
    param_type: SearchParamType,
    value: &SearchValue,
    modifier: Option<&SearchModifier>,
) -> Result<SqlFragment, SearchError> {
    match param_type {
        SearchParamType::String => Ok(StringHandler::build_sql(value, modifier)),
        SearchParamType::Token => Ok(TokenHandler::build_sql(value)),
        SearchParamType::Date => DateHandler::build_sql(value),
        SearchParamType::Number => NumberHandler::build_sql(value),
        SearchParamType::Quantity => QuantityHandler::build_sql(value),
        SearchParamType::Reference => Ok(ReferenceHandler::build_sql(value, modifier)),
        SearchParamType::Uri => Ok(UriHandler::build_sql(value)),
        SearchParamType::Composite | SearchParamType::Special => {
            Err(SearchError::QueryParseError {
                message: format!("{} values need a dedicated handler", param_type),
            })
        }
    }
}
