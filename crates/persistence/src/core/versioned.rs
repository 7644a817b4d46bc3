//! Version-aware storage operations.

use async_trait::async_trait;

use crate::error::{ConcurrencyError, StorageError, StorageResult};
use crate::types::{StoredResource, normalize_etag};

use super::storage::ResourceStorage;

/// Version-aware reads.
#[async_trait]
pub trait VersionedStorage: ResourceStorage {
    /// Reads a specific version, including deleted markers.
    ///
    /// Returns `None` if the resource or version does not exist.
    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> StorageResult<Option<StoredResource>>;

    /// Lists every version id of a resource, oldest first.
    async fn list_versions(&self, resource_type: &str, id: &str) -> StorageResult<Vec<String>>;
}

/// Compares an `If-Match` value with the current version.
///
/// The expected value may be a bare version id or an ETag.
pub fn check_version_match(
    resource_type: &str,
    id: &str,
    expected: &str,
    actual: &str,
) -> StorageResult<()> {
    let expected = normalize_etag(expected);
    if expected == actual {
        Ok(())
    } else {
        Err(StorageError::Concurrency(ConcurrencyError::VersionConflict {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            expected_version: expected.to_string(),
            actual_version: actual.to_string(),
        }))
    }
}

/// Returns the version id following `current`.
pub fn next_version(current: &str) -> String {
    (current.parse::<u64>().unwrap_or(0) + 1).to_string()
}
