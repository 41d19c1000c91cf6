//! Warden protocol types.
//!
//! This crate defines the values, expression trees, query plans, and the
//! descriptor wire format shared by the compiler and the security engine.
//!
//! # Modules
//!
//! - [`value`] - Runtime values for parameters, rows, and results
//! - [`expr`] - Expression AST (lambdas, member access, sequence calls)
//! - [`query`] - Immutable query plans and results
//! - [`descriptor`] - `[op, text, ...args]` descriptor tuples and requests
//! - [`error`] - Protocol error types
//!
//! # Example
//!
//! ```
//! use warden_proto::{Expr, Lambda, QueryPlan};
//!
//! let plan = QueryPlan::new("Document")
//!     .filter(Lambda::new("x", Expr::var("x").member("OwnerId").eq(Expr::lit(2))))
//!     .take(10);
//! assert_eq!(plan.ops().len(), 2);
//! ```

pub mod descriptor;
pub mod error;
pub mod expr;
pub mod query;
pub mod value;

pub use error::Error;

// Re-export commonly used types at crate root
pub use descriptor::{Descriptor, DescriptorOp, QueryRequest};
pub use expr::{BinaryOp, Expr, Lambda, Method, UnaryOp};
pub use query::{Page, QueryOp, QueryPlan, QueryResult};
pub use value::{Value, ValueKind, TYPE_TAG};
