//! Search provider trait.
//!
//! A [`SearchProvider`] answers a parsed [`SearchQuery`] with one page of
//! matches plus the resources pulled in by `_include`/`_revinclude`. Deleted
//! resources never appear in either.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageResult;
use crate::types::{BundleEntry, Page, SearchBundle, SearchQuery, StoredResource};

use super::storage::ResourceStorage;

/// Result of a search operation.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matching resources of the requested page. `page_info.total`
    /// counts every match.
    pub resources: Page<StoredResource>,

    /// Included resources (from _include/_revinclude). Not counted in the total.
    pub included: Vec<StoredResource>,
}

impl SearchResult {
    /// Creates a new search result.
    pub fn new(resources: Page<StoredResource>) -> Self {
        Self {
            resources,
            included: Vec::new(),
        }
    }

    /// Adds included resources.
    pub fn with_included(mut self, included: Vec<StoredResource>) -> Self {
        self.included = included;
        self
    }

    /// Returns the total number of matches.
    pub fn total(&self) -> u64 {
        self.resources.page_info.total
    }

    /// Converts the result to a searchset bundle.
    ///
    /// `present` renders each stored body for the caller. `link_base` is
    /// the search URL without paging parameters (see [`search_link_base`]).
    pub fn to_bundle<F>(&self, base_url: &str, link_base: &str, present: F) -> StorageResult<SearchBundle>
    where
        F: Fn(&StoredResource) -> StorageResult<Value>,
    {
        let mut bundle = SearchBundle::new()
            .with_total(self.total())
            .with_paging_links(link_base, &self.resources.page_info);

        for resource in &self.resources.items {
            bundle = bundle.with_entry(BundleEntry::match_entry(
                full_url(base_url, resource),
                present(resource)?,
            ));
        }
        for resource in &self.included {
            bundle = bundle.with_entry(BundleEntry::include_entry(
                full_url(base_url, resource),
                present(resource)?,
            ));
        }
        Ok(bundle)
    }
}

/// Returns `base/Type/id`, or `Type/id` for an empty base.
pub fn full_url(base_url: &str, resource: &StoredResource) -> String {
    if base_url.is_empty() {
        resource.url()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), resource.url())
    }
}

/// Rebuilds `Type?params` from the query's echoed parameters.
pub fn search_link_base(query: &SearchQuery) -> String {
    if query.link_params.is_empty() {
        return query.resource_type.clone();
    }
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query.link_params.iter())
        .finish();
    format!("{}?{}", query.resource_type, encoded)
}

/// Search provider for single resource type queries: `GET [type]?[parameters]`.
#[async_trait]
pub trait SearchProvider: ResourceStorage {
    /// Runs a search and returns one page of matches with their includes.
    ///
    /// # Errors
    ///
    /// * `StorageError::Search(Timeout)` - the search exceeded its budget
    async fn search(&self, query: &SearchQuery) -> StorageResult<SearchResult>;

    /// Counts every match of a query, ignoring paging and includes.
    async fn search_count(&self, query: &SearchQuery) -> StorageResult<u64>;
}
