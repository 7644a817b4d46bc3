//! FhirVault persistence engine
//!
//! This crate stores FHIR resources as versioned JSON documents in SQLite and
//! answers FHIR search, history, Bundle and `$everything` requests over them.
//!
//! # Features
//!
//! - **Versioned storage**: every write is a new version; deletes are soft and history is kept
//! - **Search index**: typed parameters extracted and re-indexed in the write's transaction
//! - **Full FHIR search**: prefixes, modifiers, chaining, `_has`, composites, `_include`/`_revinclude`, sort and paging
//! - **Bundles**: atomic `transaction` and per-entry `batch` processing with timeouts
//! - **Multi-version**: R4/R5 detection, conversion and NATIVE/CANONICAL/HYBRID/MULTI_VERSION storage strategies
//! - **OperationOutcome**: every error renders with its HTTP status and FHIRPath locations
//!
//! # Cargo features
//!
//! - `sqlite` (default) - the SQLite backend, [`engine`] and the pooled connection stack
//! - `telemetry` - [`telemetry::init_tracing`] for embedding binaries and tests
//!
//! # Architecture
//!
//! - [`types`] - Typed resource wrapper, stored resources, search query and Bundle types
//! - [`error`] - Error hierarchy and HTTP status mapping
//! - [`core`] - Storage, history, search, transaction, Bundle and compartment traits
//! - [`search`] - Parameter registry, extraction and query parsing
//! - [`version`] - Version detection, converters and the storage negotiator
//! - [`bundle`] - Bundle parsing, placeholder resolution and response assembly
//! - [`compartment`] - Compartment definitions and `$everything` traversal
//! - [`outcome`], [`validation`] - OperationOutcome rendering and `$validate`
//! - [`config`], [`cache`] - Engine configuration and the rendered-output TTL cache
//! - [`backends`] - The SQLite implementation of the traits
//! - [`engine`] - The service a REST layer calls
//!
//! # Quick Start
//!
//! ```
//! use fhirvault_persistence::engine::FhirEngine;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let engine = FhirEngine::in_memory().unwrap();
//!
//! engine
//!     .create(
//!         "Patient",
//!         json!({"resourceType": "Patient", "id": "p1", "name": [{"family": "Smith"}]}),
//!         None,
//!     )
//!     .await
//!     .unwrap();
//!
//! let params = vec![("name".to_string(), "smi".to_string())];
//! let bundle = engine.search("Patient", &params, None).await.unwrap().body.unwrap();
//! assert_eq!(bundle["total"], 1);
//! # });
//! ```
//!
//! # Configuration
//!
//! ```
//! use fhirvault_persistence::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(
//!     r#"{"search": {"default_count": 20, "timeout": "5s"}, "versioning": {"strategy": "HYBRID"}}"#,
//! )
//! .unwrap();
//! assert_eq!(config.search.default_count, 20);
//! assert_eq!(config.search.max_count, 1000);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod bundle;
pub mod cache;
pub mod compartment;
pub mod config;
pub mod core;
#[cfg(feature = "sqlite")]
pub mod engine;
pub mod error;
pub mod outcome;
pub mod search;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod types;
pub mod validation;
pub mod version;

// Re-export commonly used types at crate root
pub use config::EngineConfig;
pub use error::{StorageError, StorageResult};
pub use types::{FhirResource, ResourceType, SearchQuery, StoredResource};
pub use version::{FhirVersion, StorageStrategy};

#[cfg(feature = "sqlite")]
pub use engine::{EngineResponse, FhirEngine};

// Re-export core traits
pub use core::{
    Backend, BackendKind, BundleProvider, CompartmentProvider, ConditionalStorage,
    InstanceHistoryProvider, ResourceStorage, SearchProvider, Transaction, TransactionProvider,
    TypeHistoryProvider, VersionedStorage,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
