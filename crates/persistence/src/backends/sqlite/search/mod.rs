//! SQLite search implementation.
//!
//! - [`query_builder`] - Translates a parsed query into SQL over `resources`
//! - [`chain_builder`] - Forward chains and `_has` through `resource_references`
//! - [`parameter_handlers`] - Row conditions per parameter type
//! - [`writer`] - Maintains the index, reference and compartment rows

pub mod chain_builder;
pub mod parameter_handlers;
pub mod query_builder;
pub mod writer;

pub use chain_builder::ChainBuilder;
pub use query_builder::{QueryBuilder, SqlFragment, SqlParam};
pub use writer::SqliteSearchIndexWriter;
