//! Quantity parameter SQL handler.

use crate::error::SearchError;
use crate::types::SearchValue;

use super::super::query_builder::{SqlFragment, SqlParam};
use super::number::{NumberHandler, parse_number};

/// Handles quantity parameter SQL generation.
pub struct QuantityHandler;

impl QuantityHandler {
    /// Builds SQL for a quantity value of the form `number|system|code`.
    ///
    /// The unit part matches either the coded unit or the display unit.
    pub fn build_sql(value: &SearchValue) -> Result<SqlFragment, SearchError> {
        let mut parts = value.value.splitn(3, '|');
        let number = parse_number(parts.next().unwrap_or_default())?;
        let system = parts.next().filter(|s| !s.is_empty());
        let code = parts.next().filter(|s| !s.is_empty());

        let mut fragment = NumberHandler::compare("value_quantity_value", value.prefix, number);
        if let Some(system) = system {
            fragment = fragment.and(SqlFragment::with_params(
                "value_quantity_system = ?",
                vec![SqlParam::string(system)],
            ));
        }
        if let Some(code) = code {
            fragment = fragment.and(SqlFragment::with_params(
                "value_quantity_code = ? OR value_quantity_unit = ?",
                vec![SqlParam::string(code), SqlParam::string(code)],
            ));
        }
        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchParamType;

    #[test]
    fn test_quantity_number_only() {
        let frag =
            QuantityHandler::build_sql(&SearchValue::parse("gt100", SearchParamType::Quantity))
                .unwrap();
        assert_eq!(frag.sql, "value_quantity_value > ?");
    }

    #[test]
    fn test_quantity_with_units() {
        let frag = QuantityHandler::build_sql(&SearchValue::parse(
            "5.4|http://unitsofmeasure.org|mg",
            SearchParamType::Quantity,
        ))
        .unwrap();
        assert!(frag.sql.contains("value_quantity_system = ?"));
        assert!(frag.sql.contains("value_quantity_code = ?"));
        assert_eq!(frag.params.len(), 5);
    }

    #[test]
    fn test_quantity_code_without_system() {
        let frag = QuantityHandler::build_sql(&SearchValue::parse(
            "5.4||mg",
            SearchParamType::Quantity,
        ))
        .unwrap();
        assert!(!frag.sql.contains("value_quantity_system"));
        assert_eq!(frag.params.len(), 4);
    }
}
