//! Domain types for postdrop.
//!
//! - Record: a post parsed from one template file
//! - Association: a category or tag name attached to a stored record

pub mod record;

// Re-export commonly used types
pub use record::{split_names, Association, AssociationKind, ContentRecord};
