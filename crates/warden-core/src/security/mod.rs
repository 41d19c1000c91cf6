//! Row-level security.
//!
//! Every entity type carries up to four rules (select, insert, update,
//! delete). A rule is a function from a query plan and the current
//! [`Principal`] to a narrower plan. The [`RuleRegistry`] resolves rules
//! across inheritance and is the single source the query and mutation
//! layers consult; a type without a rule is denied.
//!
//! # Example
//!
//! ```ignore
//! use warden_core::security::{RuleRegistry, RuleSet, SecurityRule, PolicyRule};
//!
//! let owner = PolicyRule::from("x => x.OwnerId == $principal".to_string())
//!     .compile(&catalog, "Folder")?;
//! let registry = RuleRegistry::builder(catalog.clone())
//!     .register("Folder", RuleSet::new().all(owner))
//!     .build()?;
//! ```

pub mod error;
pub mod ignore;
pub mod principal;
pub mod registry;
pub mod rule;

pub use error::{FieldError, SecurityError, SecurityResult};
pub use ignore::{IgnoreCondition, PropertyFlags};
pub use principal::Principal;
pub use registry::{ResolvedRule, RuleRegistry, RuleRegistryBuilder};
pub use rule::{Operation, PolicyRule, RuleFn, RuleSet, SecurityRule};
