//! Error types for the persistence layer.
//!
//! This module defines all error types used throughout the engine, following a
//! hierarchy that separates resource state errors, concurrency errors,
//! validation errors, search errors, transaction errors and version
//! negotiation errors.
//!
//! Every [`StorageError`] knows the HTTP status and FHIR issue code it maps to,
//! which is what the [`outcome`](crate::outcome) builder renders.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Concurrency and versioning errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Search operation errors
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Transaction and bundle errors
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// FHIR version detection and conversion errors
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors related to resource state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// A resource with the given ID already exists.
    #[error("resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    /// The resource has been deleted (HTTP 410 Gone).
    #[error("resource deleted: {resource_type}/{id}")]
    Gone {
        resource_type: String,
        id: String,
        deleted_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// The requested version of the resource was not found.
    #[error("version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: String,
    },
}

/// Errors related to concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// Version conflict detected during optimistic locking.
    #[error("version conflict on {resource_type}/{id}: expected {expected_version}, found {actual_version}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected_version: String,
        actual_version: String,
    },

    /// A conditional operation matched more than one resource.
    #[error("conditional {operation} on {resource_type} matched {count} resources, expected at most 1")]
    MultipleMatches {
        operation: String,
        resource_type: String,
        count: usize,
    },
}

/// Errors related to resource validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The resource failed content validation.
    #[error("invalid resource: {message}")]
    InvalidResource {
        message: String,
        details: Vec<ValidationDetail>,
    },

    /// The search parameter is invalid.
    #[error("invalid search parameter {parameter}: {message}")]
    InvalidSearchParameter { parameter: String, message: String },

    /// The resource type is not supported.
    #[error("unsupported resource type: {resource_type}")]
    UnsupportedResourceType { resource_type: String },

    /// Missing required field.
    #[error("missing required field: {field}")]
    MissingRequiredField { field: String },

    /// Invalid reference format.
    #[error("invalid reference {reference}: {message}")]
    InvalidReference { reference: String, message: String },

    /// The logical id does not match the FHIR id grammar.
    #[error("invalid resource id: {id}")]
    InvalidId { id: String },

    /// The resource type in the body does not match the target type.
    #[error("resource type mismatch: expected {expected}, found {actual}")]
    ResourceTypeMismatch { expected: String, actual: String },
}

/// Detailed validation error information.
#[derive(Debug, Clone)]
pub struct ValidationDetail {
    /// The path to the field with the error (FHIRPath expression).
    pub path: String,
    /// A human-readable error message.
    pub message: String,
    /// The type of validation error.
    pub severity: ValidationSeverity,
}

impl ValidationDetail {
    /// Creates an error-level detail for the given path.
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Creates a warning-level detail for the given path.
    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity level for validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Fatal error - operation cannot proceed.
    Error,
    /// Warning - operation can proceed but with concerns.
    Warning,
    /// Informational - no action required.
    Information,
}

impl fmt::Display for ValidationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationSeverity::Error => write!(f, "error"),
            ValidationSeverity::Warning => write!(f, "warning"),
            ValidationSeverity::Information => write!(f, "information"),
        }
    }
}

/// Errors related to search operations.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The search modifier is not supported for this parameter type.
    #[error("unsupported modifier '{modifier}' for parameter type '{param_type}'")]
    UnsupportedModifier {
        modifier: String,
        param_type: String,
    },

    /// A chain could not be resolved to a target type.
    #[error("cannot resolve chain {chain}: {message}")]
    InvalidChain { chain: String, message: String },

    /// Search query parsing failed.
    #[error("failed to parse search query: {message}")]
    QueryParseError { message: String },

    /// Composite search parameter error.
    #[error("invalid composite search parameter: {message}")]
    InvalidComposite { message: String },

    /// The search was cancelled because it exceeded its time budget.
    #[error("search timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors related to transactions and bundle processing.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Transaction timed out and was rolled back.
    #[error("transaction timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Transaction was rolled back.
    #[error("transaction rolled back: {reason}")]
    RolledBack { reason: String },

    /// Transaction is no longer valid (already committed or rolled back).
    #[error("transaction no longer valid")]
    InvalidTransaction,

    /// An entry of a transaction bundle failed.
    #[error("bundle processing error at entry {index}: {message}")]
    BundleError {
        index: usize,
        message: String,
        #[source]
        source: Option<Box<StorageError>>,
    },

    /// The bundle structure is invalid; nothing was executed.
    #[error("malformed bundle: {message}")]
    MalformedBundle {
        message: String,
        expression: Option<String>,
    },
}

/// Errors related to FHIR version detection and conversion.
#[derive(Error, Debug)]
pub enum VersionError {
    /// The version string is not a known FHIR release.
    #[error("unknown FHIR version: {version}")]
    UnknownVersion { version: String },

    /// No conversion path exists between the two versions.
    #[error("cannot convert {resource_type} from {from} to {to}")]
    UnsupportedConversion {
        resource_type: String,
        from: String,
        to: String,
    },

    /// A conversion step failed on malformed input.
    #[error("conversion of {resource_type} failed at {path}: {message}")]
    ConversionFailed {
        resource_type: String,
        path: String,
        message: String,
    },

    /// The retained original payload could not be decoded.
    #[error("corrupt original payload on {resource_type}/{id}: {message}")]
    CorruptPayload {
        resource_type: String,
        id: String,
        message: String,
    },
}

/// Errors originating from the database backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Schema migration error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution error.
    #[error("query execution failed: {message}")]
    QueryError { message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Returns the HTTP status code this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            StorageError::Resource(err) => match err {
                ResourceError::NotFound { .. } | ResourceError::VersionNotFound { .. } => 404,
                ResourceError::AlreadyExists { .. } => 409,
                ResourceError::Gone { .. } => 410,
            },
            StorageError::Concurrency(_) => 409,
            StorageError::Validation(err) => match err {
                ValidationError::UnsupportedResourceType { .. } => 404,
                ValidationError::InvalidResource { .. } => 422,
                _ => 400,
            },
            StorageError::Search(err) => match err {
                SearchError::Timeout { .. } => 408,
                _ => 400,
            },
            StorageError::Transaction(err) => match err {
                TransactionError::Timeout { .. } => 408,
                TransactionError::MalformedBundle { .. } => 400,
                TransactionError::BundleError {
                    source: Some(inner),
                    ..
                } => inner.http_status(),
                TransactionError::BundleError { .. } => 400,
                TransactionError::RolledBack { .. } | TransactionError::InvalidTransaction => 500,
            },
            StorageError::Version(err) => match err {
                VersionError::UnknownVersion { .. } => 400,
                VersionError::UnsupportedConversion { .. } => 422,
                VersionError::ConversionFailed { .. } => 422,
                VersionError::CorruptPayload { .. } => 500,
            },
            StorageError::Backend(_) => 500,
        }
    }

    /// Returns the FHIR `IssueType` code this error maps to.
    pub fn issue_code(&self) -> &'static str {
        match self {
            StorageError::Resource(err) => match err {
                ResourceError::NotFound { .. } | ResourceError::VersionNotFound { .. } => {
                    "not-found"
                }
                ResourceError::AlreadyExists { .. } => "duplicate",
                ResourceError::Gone { .. } => "deleted",
            },
            StorageError::Concurrency(err) => match err {
                ConcurrencyError::VersionConflict { .. } => "conflict",
                ConcurrencyError::MultipleMatches { .. } => "multiple-matches",
            },
            StorageError::Validation(err) => match err {
                ValidationError::UnsupportedResourceType { .. } => "not-supported",
                ValidationError::MissingRequiredField { .. } => "required",
                ValidationError::InvalidResource { .. } => "processing",
                _ => "invalid",
            },
            StorageError::Search(err) => match err {
                SearchError::Timeout { .. } => "timeout",
                SearchError::UnsupportedModifier { .. } => "not-supported",
                _ => "invalid",
            },
            StorageError::Transaction(err) => match err {
                TransactionError::Timeout { .. } => "timeout",
                TransactionError::MalformedBundle { .. } => "structure",
                TransactionError::BundleError {
                    source: Some(inner),
                    ..
                } => inner.issue_code(),
                TransactionError::BundleError { .. } => "processing",
                TransactionError::RolledBack { .. } | TransactionError::InvalidTransaction => {
                    "exception"
                }
            },
            StorageError::Version(err) => match err {
                VersionError::UnknownVersion { .. } => "value",
                VersionError::UnsupportedConversion { .. } => "not-supported",
                VersionError::ConversionFailed { .. } => "processing",
                VersionError::CorruptPayload { .. } => "exception",
            },
            StorageError::Backend(_) => "exception",
        }
    }

    /// Returns the FHIRPath expressions pinpointing the offending element, if known.
    pub fn expressions(&self) -> Vec<String> {
        match self {
            StorageError::Validation(ValidationError::InvalidResource { details, .. }) => {
                details.iter().map(|d| d.path.clone()).collect()
            }
            StorageError::Validation(ValidationError::MissingRequiredField { field }) => {
                vec![field.clone()]
            }
            StorageError::Validation(ValidationError::InvalidId { .. }) => vec!["id".to_string()],
            StorageError::Validation(ValidationError::ResourceTypeMismatch { .. }) => {
                vec!["resourceType".to_string()]
            }
            StorageError::Transaction(TransactionError::MalformedBundle {
                expression: Some(expr),
                ..
            }) => vec![expr.clone()],
            StorageError::Transaction(TransactionError::BundleError {
                index,
                source: Some(inner),
                ..
            }) => inner
                .expressions()
                .into_iter()
                .map(|e| format!("Bundle.entry[{}].resource.{}", index, e))
                .collect(),
            StorageError::Version(VersionError::ConversionFailed { path, .. }) => {
                vec![path.clone()]
            }
            _ => Vec::new(),
        }
    }

    /// Returns true if this error is a conflict (version mismatch or ambiguous match).
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Concurrency(_))
    }
}

// Implement conversions from common error types

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

impl From<json_patch::PatchError> for StorageError {
    fn from(err: json_patch::PatchError) -> Self {
        StorageError::Validation(ValidationError::InvalidResource {
            message: format!("patch could not be applied: {}", err),
            details: Vec::new(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}
