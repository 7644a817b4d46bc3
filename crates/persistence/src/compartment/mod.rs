//! Compartments and `$everything`.
//!
//! - [`definitions`] - Which reference parameters place a resource in a compartment
//! - [`everything`] - Worklist traversal from an owner through its members' references
//!
//! Membership rows are derived from the same extracted values as the search
//! index and are rewritten with them on every write.

pub mod definitions;
pub mod everything;

pub use definitions::{
    COMPARTMENTS, CompartmentDefinition, Membership, PATIENT_COMPARTMENT, definition, memberships,
};
pub use everything::collect;
