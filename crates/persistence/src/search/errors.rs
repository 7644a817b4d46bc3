//! Errors raised while loading parameter definitions, registering them and
//! extracting index values.
//!
//! Extraction errors never fail a write; the extractor logs them and skips
//! the field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A SearchParameter definition that could not be loaded.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum LoaderError {
    /// The definition is structurally wrong.
    #[error("Invalid SearchParameter{}: {message}", display_url(.url))]
    InvalidResource {
        /// What was wrong.
        message: String,
        /// Canonical URL of the definition, when it has one.
        url: Option<String>,
    },

    /// A required element is absent.
    #[error("SearchParameter{} missing required field '{field}'", display_url(.url))]
    MissingField {
        /// The absent element.
        field: String,
        /// Canonical URL of the definition, when it has one.
        url: Option<String>,
    },
}

fn display_url(url: &Option<String>) -> String {
    url.as_deref()
        .map(|u| format!(" '{}'", u))
        .unwrap_or_default()
}

/// A definition the registry refused.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum RegistryError {
    /// Another definition already uses this canonical URL.
    #[error("SearchParameter with URL '{url}' already exists")]
    DuplicateUrl {
        /// The clashing URL.
        url: String,
    },

    /// The definition cannot be indexed.
    #[error("Invalid SearchParameter definition: {message}")]
    InvalidDefinition {
        /// What was wrong.
        message: String,
    },
}

/// A field that could not be turned into index rows.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ExtractionError {
    /// The path expression is not supported.
    #[error("Invalid path expression '{expression}': {message}")]
    InvalidExpression {
        /// The expression.
        expression: String,
        /// What was wrong.
        message: String,
    },

    /// A value did not have the shape its parameter type needs.
    #[error("Cannot convert '{actual_value}' to {expected_type} for parameter '{param_name}'")]
    ConversionFailed {
        /// The parameter code.
        param_name: String,
        /// The parameter type.
        expected_type: String,
        /// The offending value.
        actual_value: String,
    },

    /// The body is not a JSON object.
    #[error("Invalid resource: {message}")]
    InvalidResource {
        /// What was wrong.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_error_mentions_url_when_known() {
        let with_url = LoaderError::MissingField {
            field: "expression".to_string(),
            url: Some("http://example.org/SearchParameter/test".to_string()),
        };
        assert_eq!(
            with_url.to_string(),
            "SearchParameter 'http://example.org/SearchParameter/test' missing required field 'expression'"
        );

        let without = LoaderError::InvalidResource {
            message: "not an object".to_string(),
            url: None,
        };
        assert_eq!(without.to_string(), "Invalid SearchParameter: not an object");
    }

    #[test]
    fn test_extraction_error_display() {
        let err = ExtractionError::ConversionFailed {
            param_name: "value-quantity".to_string(),
            expected_type: "quantity".to_string(),
            actual_value: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot convert 'abc' to quantity for parameter 'value-quantity'"
        );
    }
}
