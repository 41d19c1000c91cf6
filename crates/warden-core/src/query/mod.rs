//! Secured query engine.
//!
//! This module rewrites caller plans so every reachable navigation is filtered
//! by its target's select rule, then executes them over a [`RowSource`].
//!
//! [`RowSource`]: crate::storage::RowSource

mod eval;
mod executor;
mod include;
mod inject;
mod service;
mod shape;

pub use eval::Evaluator;
pub use executor::{IncludeStrategy, QueryExecutor, DEFAULT_MAX_INCLUDE_DEPTH};
pub use include::{Guard, IncludeHop, IncludeNode, IncludePath, IncludeTree};
pub use inject::{FilterInjector, SecuredPlan};
pub use service::QueryService;
pub use shape::{resolve_call, Shape};
