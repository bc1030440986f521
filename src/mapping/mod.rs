//! Field mappings for copying relations.
//!
//! A mapping lists every output field with the source field it is read from,
//! so a copy can rename fields while passing the rest through unchanged.

mod rules;

pub use rules::{FieldMapping, build_mapping};
