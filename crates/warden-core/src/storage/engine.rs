//! Storage engine implementation.

use sled::{Db, Tree};
use warden_proto::Value;

use super::{RowKey, RowSource, StorageConfig};
use crate::error::Error;

/// Prefix of the per-hierarchy row trees.
const ROWS_PREFIX: &str = "rows:";

/// Row store wrapping sled.
///
/// Each hierarchy root gets its own tree, keyed by the encoded [`RowKey`]
/// and holding the row as JSON. Rows carry their runtime type in `$type`.
pub struct StorageEngine {
    db: Db,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        Ok(Self { db })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Tree holding the rows of a hierarchy.
    pub(crate) fn rows_tree(&self, root: &str) -> Result<Tree, Error> {
        Ok(self.db.open_tree(format!("{}{}", ROWS_PREFIX, root))?)
    }

    /// Insert or replace a row outside any transaction.
    pub fn put(&self, root: &str, key: &RowKey, row: &Value) -> Result<(), Error> {
        self.rows_tree(root)?
            .insert(key.encode(), encode_row(row)?)?;
        Ok(())
    }

    /// Remove a row outside any transaction. Returns whether it existed.
    pub fn delete(&self, root: &str, key: &RowKey) -> Result<bool, Error> {
        Ok(self.rows_tree(root)?.remove(key.encode())?.is_some())
    }

    /// Raw `(encoded key, row)` pairs of a hierarchy in key order.
    pub(crate) fn scan_entries(&self, root: &str) -> Result<Vec<(Vec<u8>, Value)>, Error> {
        let tree = self.rows_tree(root)?;
        let mut rows = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (key, bytes) = entry?;
            rows.push((key.to_vec(), decode_row(&bytes)?));
        }
        Ok(rows)
    }

    /// Next value of the monotonic id generator, starting at 1.
    pub fn generate_id(&self) -> Result<i64, Error> {
        let id = self.db.generate_id()?;
        i64::try_from(id + 1).map_err(|_| Error::InvalidData("id generator exhausted".into()))
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}

impl RowSource for StorageEngine {
    fn scan(&self, root: &str) -> Result<Vec<Value>, Error> {
        Ok(self
            .scan_entries(root)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    fn get(&self, root: &str, key: &RowKey) -> Result<Option<Value>, Error> {
        match self.rows_tree(root)?.get(key.encode())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn encode_row(row: &Value) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(row)?)
}

pub(crate) fn decode_row(bytes: &[u8]) -> Result<Value, Error> {
    Ok(serde_json::from_slice(bytes)?)
}
