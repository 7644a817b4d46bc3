//! Core types for the persistence layer.
//!
//! This module provides the fundamental types used throughout the engine:
//!
//! - [`FhirResource`], [`ResourceType`] - Typed wrapper over a JSON resource body
//! - [`StoredResource`] - A FHIR resource with persistence metadata
//! - [`SearchParameter`], [`SearchQuery`] - Search parameter types
//! - [`PageInfo`], [`SearchBundle`] - Paging and searchset Bundle types
//!
//! # Examples
//!
//! ## Lifting a raw document
//!
//! ```
//! use fhirvault_persistence::types::{FhirResource, ResourceType};
//! use serde_json::json;
//!
//! let resource = FhirResource::parse(json!({
//!     "resourceType": "Patient",
//!     "id": "patient-123",
//!     "name": [{"family": "Smith", "given": ["John"]}]
//! }))
//! .unwrap();
//!
//! assert_eq!(resource.resource_type(), ResourceType::Patient);
//! assert_eq!(resource.id(), Some("patient-123"));
//! ```
//!
//! ## Building a Search Query
//!
//! ```
//! use fhirvault_persistence::types::{
//!     SearchQuery, SearchParameter, SearchParamType, SearchValue, SortDirective
//! };
//!
//! let query = SearchQuery::new("Patient")
//!     .with_parameter(SearchParameter::new(
//!         "name",
//!         SearchParamType::String,
//!         vec![SearchValue::eq("Smith")],
//!     ))
//!     .with_sort(SortDirective::parse("-_lastUpdated"))
//!     .with_count(20);
//! ```

mod pagination;
mod resource;
mod search_params;
mod stored_resource;

pub use pagination::{
    BundleEntry, BundleEntrySearch, BundleLink, Page, PageInfo, SearchBundle, SearchEntryMode,
};

pub use resource::{FhirResource, ResourceType, is_valid_id};

pub use search_params::{
    ChainLink, CompositeSearchComponent, IncludeDirective, IncludeType, ReverseChainedParameter,
    SearchModifier, SearchParamType, SearchParameter, SearchPrefix, SearchQuery, SearchValue,
    SortDirection, SortDirective,
};

pub use stored_resource::{ResourceMethod, StoredResource, normalize_etag};
