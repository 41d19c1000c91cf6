//! Row storage on sled.

mod config;
pub(crate) mod engine;
mod key;
mod transaction;

pub use config::{StorageConfig, DEFAULT_CACHE_CAPACITY};
pub use engine::StorageEngine;
pub use key::{KeyPart, RowKey};
pub use transaction::{Transaction, TransactionOp};

use warden_proto::Value;

use crate::error::Error;

/// Read access to rows, either committed or through a transaction.
pub trait RowSource {
    /// All rows of a hierarchy, in key order.
    fn scan(&self, root: &str) -> Result<Vec<Value>, Error>;

    /// One row by key.
    fn get(&self, root: &str, key: &RowKey) -> Result<Option<Value>, Error>;
}
