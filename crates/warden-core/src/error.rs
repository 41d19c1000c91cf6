//! Core error types.

use thiserror::Error;

/// Errors raised by the catalog, storage and evaluation layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] warden_proto::Error),

    /// Row encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// Schema or registry configuration is inconsistent.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Entity type not present in the catalog.
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),

    /// Row not found.
    #[error("row not found: {entity} {key}")]
    NotFound { entity: String, key: String },

    /// Transaction error.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Expression evaluation failed at runtime.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
