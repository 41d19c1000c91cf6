//! Entity catalog.
//!
//! The catalog holds the entity types the security engine reasons about:
//! keys, scalar fields, navigations and single inheritance.

mod catalog;
mod entity;
mod field;
mod types;

pub use catalog::{Catalog, Member};
pub use entity::EntityType;
pub use field::{FieldDef, NavigationDef, NavigationKind};
pub use types::ScalarType;
