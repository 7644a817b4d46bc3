//! Compartment provider trait: `GET [type]/[id]/$everything`.

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::StoredResource;

use super::storage::ResourceStorage;

/// Resolves compartment members and the resources they reference.
#[async_trait]
pub trait CompartmentProvider: ResourceStorage {
    /// Returns the compartment owner, its live members and the resources
    /// reachable from them within `max_depth` reference hops.
    ///
    /// The owner comes first; every resource appears once.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - the owner does not exist
    /// * `StorageError::Resource(Gone)` - the owner was deleted
    async fn everything(
        &self,
        compartment_type: &str,
        id: &str,
        max_depth: usize,
    ) -> StorageResult<Vec<StoredResource>>;
}
