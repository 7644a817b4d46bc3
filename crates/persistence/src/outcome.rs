//! OperationOutcome construction.
//!
//! Every user-visible failure is rendered as an `OperationOutcome`. Storage
//! errors map through [`StorageError::http_status`] and
//! [`StorageError::issue_code`]; validation details keep their FHIRPath
//! expressions so clients can pinpoint the offending element.
//!
//! ```
//! use fhirvault_persistence::outcome::{IssueSeverity, OperationOutcomeBuilder};
//!
//! let outcome = OperationOutcomeBuilder::new()
//!     .error("required", "Observation.status is required")
//!     .with_expression("Observation.status")
//!     .build();
//!
//! assert_eq!(outcome["issue"][0]["severity"], "error");
//! assert_eq!(outcome["issue"][0]["expression"][0], "Observation.status");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{StorageError, ValidationDetail, ValidationError, ValidationSeverity};

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// The operation failed.
    Fatal,
    /// The element is invalid.
    Error,
    /// A potential problem.
    Warning,
    /// Informational only.
    Information,
}

impl IssueSeverity {
    /// Returns the FHIR code.
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Fatal => "fatal",
            IssueSeverity::Error => "error",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Information => "information",
        }
    }
}

impl From<ValidationSeverity> for IssueSeverity {
    fn from(severity: ValidationSeverity) -> Self {
        match severity {
            ValidationSeverity::Error => IssueSeverity::Error,
            ValidationSeverity::Warning => IssueSeverity::Warning,
            ValidationSeverity::Information => IssueSeverity::Information,
        }
    }
}

/// One issue of an OperationOutcome.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeIssue {
    /// Severity.
    pub severity: IssueSeverity,
    /// FHIR `IssueType` code.
    pub code: String,
    /// Human-readable diagnostics.
    pub diagnostics: String,
    /// FHIRPath expressions of the offending elements.
    pub expression: Vec<String>,
    /// Legacy location paths.
    pub location: Vec<String>,
}

impl OutcomeIssue {
    /// Creates an issue.
    pub fn new(
        severity: IssueSeverity,
        code: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            diagnostics: diagnostics.into(),
            expression: Vec::new(),
            location: Vec::new(),
        }
    }

    fn to_json(&self) -> Value {
        let mut issue = json!({
            "severity": self.severity.as_str(),
            "code": self.code,
            "diagnostics": self.diagnostics,
        });
        if !self.expression.is_empty() {
            issue["expression"] = json!(self.expression);
        }
        if !self.location.is_empty() {
            issue["location"] = json!(self.location);
        }
        issue
    }
}

/// Builds OperationOutcome resources.
#[derive(Debug, Clone, Default)]
pub struct OperationOutcomeBuilder {
    issues: Vec<OutcomeIssue>,
}

impl OperationOutcomeBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an issue.
    pub fn issue(mut self, issue: OutcomeIssue) -> Self {
        self.issues.push(issue);
        self
    }

    /// Adds an error issue.
    pub fn error(self, code: &str, diagnostics: impl Into<String>) -> Self {
        self.issue(OutcomeIssue::new(IssueSeverity::Error, code, diagnostics))
    }

    /// Adds a warning issue.
    pub fn warning(self, code: &str, diagnostics: impl Into<String>) -> Self {
        self.issue(OutcomeIssue::new(IssueSeverity::Warning, code, diagnostics))
    }

    /// Adds an informational issue.
    pub fn information(self, code: &str, diagnostics: impl Into<String>) -> Self {
        self.issue(OutcomeIssue::new(
            IssueSeverity::Information,
            code,
            diagnostics,
        ))
    }

    /// Adds an expression to the last issue.
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        if let Some(last) = self.issues.last_mut() {
            let expression = expression.into();
            last.location.push(expression.clone());
            last.expression.push(expression);
        }
        self
    }

    /// Adds one issue per validation detail.
    pub fn details(mut self, details: &[ValidationDetail]) -> Self {
        for detail in details {
            let mut issue = OutcomeIssue::new(
                detail.severity.into(),
                if detail.severity == ValidationSeverity::Error {
                    "invalid"
                } else {
                    "informational"
                },
                detail.message.clone(),
            );
            issue.expression.push(detail.path.clone());
            issue.location.push(detail.path.clone());
            self.issues.push(issue);
        }
        self
    }

    /// Returns the collected issues.
    pub fn issues(&self) -> &[OutcomeIssue] {
        &self.issues
    }

    /// Renders the OperationOutcome.
    pub fn build(&self) -> Value {
        json!({
            "resourceType": "OperationOutcome",
            "issue": self.issues.iter().map(OutcomeIssue::to_json).collect::<Vec<_>>(),
        })
    }
}

impl From<&StorageError> for OperationOutcomeBuilder {
    fn from(err: &StorageError) -> Self {
        let builder = OperationOutcomeBuilder::new();
        if let StorageError::Validation(ValidationError::InvalidResource { message, details }) = err
        {
            if !details.is_empty() {
                return builder.details(details);
            }
            return builder.error(err.issue_code(), message.clone());
        }

        let mut issue = OutcomeIssue::new(IssueSeverity::Error, err.issue_code(), err.to_string());
        for expression in err.expressions() {
            issue.location.push(expression.clone());
            issue.expression.push(expression);
        }
        builder.issue(issue)
    }
}

/// Renders an error as an OperationOutcome.
pub fn from_error(err: &StorageError) -> Value {
    OperationOutcomeBuilder::from(err).build()
}

/// An OperationOutcome with a single informational issue.
pub fn all_ok(diagnostics: impl Into<String>) -> Value {
    OperationOutcomeBuilder::new()
        .information("informational", diagnostics)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConcurrencyError, ResourceError, TransactionError};

    #[test]
    fn test_builder_shape() {
        let outcome = OperationOutcomeBuilder::new()
            .warning("informational", "heads up")
            .error("invalid", "bad")
            .with_expression("Patient.birthDate")
            .build();

        assert_eq!(outcome["resourceType"], "OperationOutcome");
        let issues = outcome["issue"].as_array().unwrap();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].get("expression").is_none());
        assert_eq!(issues[1]["expression"][0], "Patient.birthDate");
        assert_eq!(issues[1]["location"][0], "Patient.birthDate");
    }

    #[test]
    fn test_from_not_found() {
        let err: StorageError = ResourceError::NotFound {
            resource_type: "Patient".to_string(),
            id: "x".to_string(),
        }
        .into();
        let outcome = from_error(&err);
        assert_eq!(outcome["issue"][0]["code"], "not-found");
        assert_eq!(outcome["issue"][0]["severity"], "error");
    }

    #[test]
    fn test_from_conflict() {
        let err: StorageError = ConcurrencyError::MultipleMatches {
            operation: "create".to_string(),
            resource_type: "Patient".to_string(),
            count: 2,
        }
        .into();
        assert_eq!(from_error(&err)["issue"][0]["code"], "multiple-matches");
    }

    #[test]
    fn test_validation_details_become_issues() {
        let err: StorageError = ValidationError::InvalidResource {
            message: "invalid".to_string(),
            details: vec![
                ValidationDetail::error("Observation.status", "status is required"),
                ValidationDetail::warning("Observation.code", "no coding"),
            ],
        }
        .into();
        let outcome = from_error(&err);
        let issues = outcome["issue"].as_array().unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0]["expression"][0], "Observation.status");
        assert_eq!(issues[1]["severity"], "warning");
    }

    #[test]
    fn test_bundle_error_expression() {
        let inner: StorageError = ValidationError::MissingRequiredField {
            field: "status".to_string(),
        }
        .into();
        let err: StorageError = TransactionError::BundleError {
            index: 3,
            message: inner.to_string(),
            source: Some(Box::new(inner)),
        }
        .into();
        let outcome = from_error(&err);
        assert_eq!(outcome["issue"][0]["code"], "required");
        assert_eq!(
            outcome["issue"][0]["expression"][0],
            "Bundle.entry[3].resource.status"
        );
    }

    #[test]
    fn test_all_ok() {
        let outcome = all_ok("Validation successful");
        assert_eq!(outcome["issue"][0]["severity"], "information");
    }
}
