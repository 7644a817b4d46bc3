//! History provider traits.
//!
//! - [`InstanceHistoryProvider`] - History for a single resource instance
//! - [`TypeHistoryProvider`] - History for all resources of a type
//!
//! Both return entries newest first, deleted markers included.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::types::{ResourceMethod, StoredResource};

use super::versioned::VersionedStorage;

/// Parameters for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    /// Only include versions written at or after this time.
    pub since: Option<DateTime<Utc>>,

    /// Maximum number of entries.
    pub count: Option<u32>,
}

impl HistoryParams {
    /// Creates new history parameters with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the since filter.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the count limit.
    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }
}

/// A single entry in a history bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The resource at this version.
    pub resource: StoredResource,

    /// The HTTP method that created this version.
    pub method: ResourceMethod,
}

/// History entries with the total number of versions matching the filter.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Entries, newest first.
    pub entries: Vec<HistoryEntry>,
    /// Versions matching the filter before `count` was applied.
    pub total: u64,
}

/// Provider for instance-level history: `GET [type]/[id]/_history`.
#[async_trait]
pub trait InstanceHistoryProvider: VersionedStorage {
    /// Returns the history of one resource.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - the resource never existed
    async fn history_instance(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage>;
}

/// Provider for type-level history: `GET [type]/_history`.
#[async_trait]
pub trait TypeHistoryProvider: InstanceHistoryProvider {
    /// Returns the history of every resource of a type.
    async fn history_type(
        &self,
        resource_type: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage>;
}
