//! Transaction traits.
//!
//! [`TransactionProvider`] hands out explicit database transactions for
//! callers that need several writes to commit or fail together.
//! [`BundleProvider`] processes whole FHIR `transaction`/`batch` Bundles.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::StorageResult;
use crate::types::StoredResource;

use super::storage::ResourceStorage;

/// A database transaction.
///
/// Changes are only persisted when `commit()` is called. Dropping an active
/// transaction rolls it back.
///
/// # Example
///
/// ```
/// use fhirvault_persistence::backends::sqlite::SqliteBackend;
/// use fhirvault_persistence::core::{ResourceStorage, Transaction, TransactionProvider};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let storage = SqliteBackend::in_memory().unwrap();
/// storage.init_schema().unwrap();
///
/// let mut tx = storage.begin_transaction().await.unwrap();
/// let patient = tx
///     .create("Patient", json!({"resourceType": "Patient"}))
///     .await
///     .unwrap();
/// tx.create(
///     "Encounter",
///     json!({
///         "resourceType": "Encounter",
///         "status": "planned",
///         "subject": {"reference": format!("Patient/{}", patient.id())}
///     }),
/// )
/// .await
/// .unwrap();
/// Box::new(tx).commit().await.unwrap();
///
/// assert_eq!(storage.count(None).await.unwrap(), 2);
/// # });
/// ```
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Creates a resource within this transaction.
    async fn create(&mut self, resource_type: &str, resource: Value)
    -> StorageResult<StoredResource>;

    /// Reads a resource within this transaction, seeing uncommitted writes.
    async fn read(&mut self, resource_type: &str, id: &str)
    -> StorageResult<Option<StoredResource>>;

    /// Updates a resource within this transaction.
    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource>;

    /// Deletes a resource within this transaction.
    async fn delete(&mut self, resource_type: &str, id: &str) -> StorageResult<()>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Rolls back the transaction.
    async fn rollback(self: Box<Self>) -> StorageResult<()>;

    /// Returns true while the transaction can still be used.
    fn is_active(&self) -> bool;
}

/// Provider for explicit transactions.
#[async_trait]
pub trait TransactionProvider: ResourceStorage {
    /// The transaction type returned by this provider.
    type Transaction: Transaction;

    /// Begins a write transaction.
    ///
    /// # Errors
    ///
    /// * `StorageError::Backend` - no connection could be acquired
    async fn begin_transaction(&self) -> StorageResult<Self::Transaction>;
}

/// Limits applied while processing a Bundle.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Budget for a whole `transaction` Bundle. Exceeding it rolls everything back.
    pub transaction_timeout: Duration,
    /// Budget for each `batch` entry.
    pub entry_timeout: Duration,
    /// Largest number of entries accepted.
    pub max_entries: usize,
    /// Base URL used for `fullUrl` values in the response. May be empty.
    pub base_url: String,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(60),
            entry_timeout: Duration::from_secs(10),
            max_entries: 1000,
            base_url: String::new(),
        }
    }
}

/// Provider for FHIR Bundle processing: `POST /`.
#[async_trait]
pub trait BundleProvider: ResourceStorage {
    /// Processes a Bundle and returns the response Bundle.
    ///
    /// `transaction` Bundles are all-or-nothing, `batch` entries succeed or
    /// fail independently, and the pass-through types are validated only.
    ///
    /// # Errors
    ///
    /// * `StorageError::Transaction(MalformedBundle)` - structure is invalid; nothing ran
    /// * `StorageError::Transaction(BundleError)` - a `transaction` entry failed; nothing persisted
    /// * `StorageError::Transaction(Timeout)` - the transaction budget was exceeded
    async fn process_bundle(&self, bundle: Value, options: &BundleOptions) -> StorageResult<Value>;
}

/// Result of a single Bundle entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleEntryResult {
    /// HTTP status code.
    pub status: u16,
    /// Location header (for creates).
    pub location: Option<String>,
    /// ETag header.
    pub etag: Option<String>,
    /// Last-Modified header.
    pub last_modified: Option<String>,
    /// Response resource (for reads, creates, updates).
    pub resource: Option<Value>,
    /// OperationOutcome for errors.
    pub outcome: Option<Value>,
}

impl BundleEntryResult {
    /// Creates a result for a written resource.
    pub fn written(status: u16, resource: &StoredResource, body: Value) -> Self {
        Self {
            status,
            location: Some(resource.versioned_url()),
            etag: Some(resource.etag().to_string()),
            last_modified: Some(resource.last_modified().to_rfc3339()),
            resource: Some(body),
            outcome: None,
        }
    }

    /// Creates a result for a create operation.
    pub fn created(resource: &StoredResource, body: Value) -> Self {
        Self::written(201, resource, body)
    }

    /// Creates a result for a read or update.
    pub fn ok(resource: &StoredResource, body: Value) -> Self {
        Self {
            location: None,
            ..Self::written(200, resource, body)
        }
    }

    /// Creates a result carrying a body without version headers (search results).
    pub fn body(body: Value) -> Self {
        Self {
            status: 200,
            location: None,
            etag: None,
            last_modified: None,
            resource: Some(body),
            outcome: None,
        }
    }

    /// Creates a result for a delete operation.
    pub fn deleted() -> Self {
        Self {
            status: 204,
            location: None,
            etag: None,
            last_modified: None,
            resource: None,
            outcome: None,
        }
    }

    /// Creates an error result.
    pub fn error(status: u16, outcome: Value) -> Self {
        Self {
            status,
            location: None,
            etag: None,
            last_modified: None,
            resource: None,
            outcome: Some(outcome),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Renders the entry of a `transaction-response`/`batch-response` Bundle.
    pub fn to_entry(&self, full_url: Option<String>) -> Value {
        let mut response = serde_json::Map::new();
        response.insert("status".to_string(), json!(status_line(self.status)));
        if let Some(location) = &self.location {
            response.insert("location".to_string(), json!(location));
        }
        if let Some(etag) = &self.etag {
            response.insert("etag".to_string(), json!(etag));
        }
        if let Some(last_modified) = &self.last_modified {
            response.insert("lastModified".to_string(), json!(last_modified));
        }
        if let Some(outcome) = &self.outcome {
            response.insert("outcome".to_string(), outcome.clone());
        }

        let mut entry = serde_json::Map::new();
        if let Some(url) = full_url {
            entry.insert("fullUrl".to_string(), json!(url));
        }
        if let Some(resource) = &self.resource {
            entry.insert("resource".to_string(), resource.clone());
        }
        entry.insert("response".to_string(), Value::Object(response));
        Value::Object(entry)
    }
}

/// Returns the `Bundle.entry.response.status` text for a status code.
pub fn status_line(status: u16) -> String {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        412 => "Precondition Failed",
        422 => "Unprocessable Entity",
        _ => return status.to_string(),
    };
    format!("{} {}", status, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::FhirVersion;

    #[test]
    fn test_created_entry() {
        let stored = StoredResource::new(
            "Patient",
            "p1",
            FhirVersion::R4,
            json!({"resourceType": "Patient", "id": "p1"}),
        );
        let result = BundleEntryResult::created(&stored, stored.content().clone());
        assert!(result.is_success());

        let entry = result.to_entry(Some("Patient/p1".to_string()));
        assert_eq!(entry["response"]["status"], "201 Created");
        assert_eq!(entry["response"]["location"], "Patient/p1/_history/1");
        assert_eq!(entry["response"]["etag"], "W/\"1\"");
        assert_eq!(entry["resource"]["id"], "p1");
    }

    #[test]
    fn test_error_entry() {
        let result = BundleEntryResult::error(409, json!({"resourceType": "OperationOutcome"}));
        assert!(!result.is_success());
        let entry = result.to_entry(None);
        assert_eq!(entry["response"]["status"], "409 Conflict");
        assert_eq!(entry["response"]["outcome"]["resourceType"], "OperationOutcome");
        assert!(entry.get("fullUrl").is_none());
    }

    #[test]
    fn test_status_line() {
        assert_eq!(status_line(204), "204 No Content");
        assert_eq!(status_line(418), "418");
    }
}
