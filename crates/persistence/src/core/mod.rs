//! Core storage traits and abstractions.
//!
//! This module provides the foundational traits for the persistence layer:
//!
//! - [`Backend`] - Database driver abstraction
//! - [`ResourceStorage`] - Core CRUD operations
//! - [`VersionedStorage`] - Version-aware operations
//! - History providers - Instance and type-level history
//! - [`SearchProvider`] - FHIR search
//! - [`Transaction`] - ACID transaction support
//! - [`BundleProvider`] - Transaction and batch Bundles
//! - [`CompartmentProvider`] - `$everything`
//!
//! # Trait Hierarchy
//!
//! ```text
//! ResourceStorage
//!     ├── VersionedStorage
//!     │       └── InstanceHistoryProvider
//!     │               └── TypeHistoryProvider
//!     ├── ConditionalStorage
//!     ├── SearchProvider
//!     ├── TransactionProvider
//!     ├── BundleProvider
//!     └── CompartmentProvider
//! ```

pub mod backend;
pub mod compartment;
pub mod history;
pub mod search;
pub mod storage;
pub mod transaction;
pub mod versioned;

pub use backend::{Backend, BackendKind, BackendPoolStats};
pub use compartment::CompartmentProvider;
pub use history::{
    HistoryEntry, HistoryPage, HistoryParams, InstanceHistoryProvider, TypeHistoryProvider,
};
pub use search::{SearchProvider, SearchResult, full_url, search_link_base};
pub use storage::{
    ConditionalCreateResult, ConditionalStorage, ConditionalUpdateResult, ResourceStorage,
    apply_patch,
};
pub use transaction::{
    BundleEntryResult, BundleOptions, BundleProvider, Transaction, TransactionProvider,
    status_line,
};
pub use versioned::{VersionedStorage, check_version_match, next_version};
