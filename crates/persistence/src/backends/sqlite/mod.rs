//! SQLite backend implementation.
//!
//! This module provides a complete SQLite implementation of all storage traits.
//! It supports both in-memory databases (for tests and embedding) and
//! file-based databases in WAL mode.
//!
//! # Features
//!
//! - Versioned CRUD with soft deletes and full history
//! - Search index, reference and compartment rows rewritten with every write
//! - Search with chaining, `_has`, composites, includes, sorting and paging
//! - Explicit transactions and `transaction`/`batch` Bundles
//! - `$everything` over compartments
//!
//! # Example
//!
//! ```
//! use fhirvault_persistence::backends::sqlite::SqliteBackend;
//! use fhirvault_persistence::core::{ResourceStorage, SearchProvider};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let backend = SqliteBackend::in_memory().unwrap();
//! backend.init_schema().unwrap();
//!
//! backend
//!     .create(
//!         "Patient",
//!         json!({"resourceType": "Patient", "name": [{"family": "Smith"}]}),
//!     )
//!     .await
//!     .unwrap();
//!
//! let query = backend
//!     .parse_query("Patient", &[("name".to_string(), "smi".to_string())])
//!     .unwrap();
//! let result = backend.search(&query).await.unwrap();
//! assert_eq!(result.total(), 1);
//! # });
//! ```
//!
//! # Schema
//!
//! ```sql
//! -- Current version of every resource, deleted ones included
//! CREATE TABLE resources (
//!     resource_type TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     version_id TEXT NOT NULL,
//!     data TEXT NOT NULL,  -- JSON data
//!     last_updated TEXT NOT NULL,
//!     fhir_version TEXT NOT NULL,
//!     is_deleted INTEGER NOT NULL DEFAULT 0,
//!     deleted_at TEXT,
//!     PRIMARY KEY (resource_type, id)
//! );
//!
//! -- Every version ever written
//! CREATE TABLE resource_history (
//!     resource_type TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     version_id TEXT NOT NULL,
//!     data TEXT NOT NULL,
//!     last_updated TEXT NOT NULL,
//!     fhir_version TEXT NOT NULL,
//!     method TEXT NOT NULL,
//!     is_deleted INTEGER NOT NULL DEFAULT 0,
//!     PRIMARY KEY (resource_type, id, version_id)
//! );
//! ```
//!
//! `search_index`, `resource_references` and `compartments` are derived
//! from the current version; `version_metadata`, `version_metadata_history`
//! and `resource_version_copies` record version negotiation.

mod backend;
mod bundle;
mod compartment;
mod schema;
mod search;
mod search_impl;
mod storage;
mod transaction;

pub use backend::SqliteBackend;
pub use search::{ChainBuilder, QueryBuilder, SqlFragment, SqlParam, SqliteSearchIndexWriter};
pub use transaction::SqliteTransaction;
