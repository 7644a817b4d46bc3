//! Search parameter management, extraction and query parsing.
//!
//! - [`registry`] - In-memory registry of active SearchParameter definitions
//! - [`loader`] - Embedded definitions and parsing of stored SearchParameter resources
//! - [`extractor`] - Path-based value extraction from resource bodies
//! - [`converters`] - Conversion between extracted JSON and typed index values
//! - [`parser`] - Raw query parameters to a validated [`SearchQuery`](crate::types::SearchQuery)
//! - [`errors`] - Search-specific error types
//!
//! # Index lifecycle
//!
//! ```text
//! write(resource)
//!   └── extractor.extract(body)       -> Vec<ExtractedValue>
//!   └── DELETE old search_index rows  (same transaction)
//!   └── INSERT new search_index rows  (same transaction)
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::RwLock;
//! use fhirvault_persistence::search::{SearchParameterExtractor, SearchParameterRegistry};
//! use serde_json::json;
//!
//! let registry = Arc::new(RwLock::new(SearchParameterRegistry::with_embedded()));
//! let extractor = SearchParameterExtractor::new(registry);
//!
//! let patient = json!({
//!     "resourceType": "Patient",
//!     "id": "p1",
//!     "name": [{"family": "Smith"}]
//! });
//! let values = extractor.extract(&patient, "Patient").unwrap();
//! assert!(values.iter().any(|v| v.param_name == "family"));
//! ```

pub mod converters;
pub mod errors;
pub mod extractor;
pub mod loader;
pub mod parser;
pub mod registry;

pub use converters::{DateRange, IndexValue, ParsedReference, ValueConverter};
pub use errors::{ExtractionError, LoaderError, RegistryError};
pub use extractor::{ExtractedValue, SearchParameterExtractor};
pub use loader::SearchParameterLoader;
pub use parser::{DEFAULT_COUNT, MAX_COUNT, SearchQueryParser, parse_query_string};
pub use registry::{
    CompositeComponentDef, SearchParameterDefinition, SearchParameterRegistry,
    SearchParameterSource, SearchParameterStatus,
};
