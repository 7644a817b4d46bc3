//! Core resource storage traits.
//!
//! [`ResourceStorage`] provides versioned CRUD over JSON resource bodies.
//! Every mutating call writes a new version, snapshots it into history and
//! rebuilds the resource's search index rows in the same database
//! transaction.
//!
//! # Example
//!
//! ```
//! use fhirvault_persistence::backends::sqlite::SqliteBackend;
//! use fhirvault_persistence::core::ResourceStorage;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let storage = SqliteBackend::in_memory().unwrap();
//! storage.init_schema().unwrap();
//!
//! let created = storage
//!     .create("Patient", json!({"resourceType": "Patient", "name": [{"family": "Smith"}]}))
//!     .await
//!     .unwrap();
//! assert_eq!(created.version_id(), "1");
//!
//! let updated = storage
//!     .update("Patient", created.id(), json!({"resourceType": "Patient", "active": true}), Some("1"))
//!     .await
//!     .unwrap();
//! assert_eq!(updated.version_id(), "2");
//!
//! storage.delete("Patient", created.id()).await.unwrap();
//! assert!(storage.read("Patient", created.id()).await.is_err());
//! # });
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StorageResult, ValidationError};
use crate::types::StoredResource;

/// Core storage trait for FHIR resources.
///
/// # Soft deletes
///
/// `delete` writes a deleted marker version. Reading a deleted resource
/// fails with `Gone`; creating it again continues the version counter.
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Returns a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Creates a resource, assigning an id when the body has none.
    ///
    /// # Errors
    ///
    /// * `StorageError::Validation` - the body is invalid or of another type
    /// * `StorageError::Resource(AlreadyExists)` - a live resource has the id
    async fn create(&self, resource_type: &str, resource: Value) -> StorageResult<StoredResource>;

    /// Reads the current version of a resource.
    ///
    /// Returns `None` if the resource never existed.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(Gone)` - the resource was deleted
    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<Option<StoredResource>>;

    /// Writes a new version of an existing resource.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - the resource does not exist
    /// * `StorageError::Resource(Gone)` - the resource was deleted
    /// * `StorageError::Concurrency(VersionConflict)` - `if_match` is stale
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource>;

    /// Soft-deletes a resource. Deleting a missing or deleted resource is a no-op.
    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<()>;

    /// Returns true if a live resource exists.
    async fn exists(&self, resource_type: &str, id: &str) -> StorageResult<bool> {
        match self.read(resource_type, id).await {
            Ok(found) => Ok(found.is_some()),
            Err(crate::error::StorageError::Resource(
                crate::error::ResourceError::Gone { .. },
            )) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Counts live resources, optionally of one type.
    async fn count(&self, resource_type: Option<&str>) -> StorageResult<u64>;
}

/// Outcome of a conditional create.
#[derive(Debug, Clone)]
pub enum ConditionalCreateResult {
    /// Nothing matched; the resource was created.
    Created(StoredResource),
    /// Exactly one resource matched; it is returned unchanged.
    Exists(StoredResource),
}

impl ConditionalCreateResult {
    /// Returns the created or matched resource.
    pub fn resource(&self) -> &StoredResource {
        match self {
            ConditionalCreateResult::Created(r) | ConditionalCreateResult::Exists(r) => r,
        }
    }

    /// Returns true if a new resource was written.
    pub fn is_created(&self) -> bool {
        matches!(self, ConditionalCreateResult::Created(_))
    }
}

/// Outcome of a conditional update.
#[derive(Debug, Clone)]
pub enum ConditionalUpdateResult {
    /// Nothing matched; the resource was created.
    Created(StoredResource),
    /// Exactly one resource matched and was updated.
    Updated(StoredResource),
}

impl ConditionalUpdateResult {
    /// Returns the written resource.
    pub fn resource(&self) -> &StoredResource {
        match self {
            ConditionalUpdateResult::Created(r) | ConditionalUpdateResult::Updated(r) => r,
        }
    }
}

/// Conditional create and update driven by search criteria.
///
/// More than one match fails with `ConcurrencyError::MultipleMatches`.
#[async_trait]
pub trait ConditionalStorage: ResourceStorage {
    /// Creates the resource unless the criteria match an existing one.
    async fn conditional_create(
        &self,
        resource_type: &str,
        resource: Value,
        criteria: &[(String, String)],
    ) -> StorageResult<ConditionalCreateResult>;

    /// Updates the single resource matching the criteria, or creates one.
    async fn conditional_update(
        &self,
        resource_type: &str,
        criteria: &[(String, String)],
        resource: Value,
    ) -> StorageResult<ConditionalUpdateResult>;
}

/// Applies an RFC 6902 JSON Patch to a resource body.
///
/// The patch may not change `resourceType` or `id`.
pub fn apply_patch(content: &Value, patch: &Value) -> StorageResult<Value> {
    let operations: json_patch::Patch = serde_json::from_value(patch.clone()).map_err(|e| {
        ValidationError::InvalidResource {
            message: format!("invalid JSON Patch document: {}", e),
            details: Vec::new(),
        }
    })?;

    let mut patched = content.clone();
    json_patch::patch(&mut patched, &operations)?;

    for field in ["resourceType", "id"] {
        if patched.get(field) != content.get(field) {
            return Err(ValidationError::InvalidResource {
                message: format!("patch may not modify {}", field),
                details: Vec::new(),
            }
            .into());
        }
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_patch() {
        let content = json!({"resourceType": "Patient", "id": "1", "active": false});
        let patch = json!([{"op": "replace", "path": "/active", "value": true}]);
        let patched = apply_patch(&content, &patch).unwrap();
        assert_eq!(patched["active"], true);
    }

    #[test]
    fn test_patch_cannot_change_identity() {
        let content = json!({"resourceType": "Patient", "id": "1"});
        let patch = json!([{"op": "replace", "path": "/id", "value": "2"}]);
        let err = apply_patch(&content, &patch).unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn test_malformed_patch() {
        let content = json!({"resourceType": "Patient", "id": "1"});
        assert!(apply_patch(&content, &json!({"op": "nope"})).is_err());
        let failing = json!([{"op": "remove", "path": "/missing"}]);
        assert!(apply_patch(&content, &failing).is_err());
    }
}
