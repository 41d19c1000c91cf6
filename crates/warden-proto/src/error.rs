//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor tuple was malformed.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A positional parameter was referenced but not supplied.
    #[error("positional parameter @{0} is not bound")]
    UnboundParameter(usize),

    /// JSON decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
