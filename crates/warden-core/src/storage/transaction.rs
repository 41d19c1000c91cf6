//! Buffered transactions over the row store.

use std::collections::{BTreeMap, HashMap};

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::debug;
use warden_proto::Value;

use super::engine::encode_row;
use super::{RowKey, RowSource, StorageEngine};
use crate::error::Error;

/// A pending operation in a transaction.
#[derive(Debug, Clone)]
pub enum TransactionOp {
    /// Insert or replace a row.
    Put {
        /// Hierarchy root whose tree holds the row.
        root: String,
        key: RowKey,
        row: Value,
    },
    /// Remove a row.
    Delete { root: String, key: RowKey },
}

impl TransactionOp {
    fn root(&self) -> &str {
        match self {
            TransactionOp::Put { root, .. } | TransactionOp::Delete { root, .. } => root,
        }
    }
}

/// A transaction for atomic multi-row writes.
///
/// Writes are buffered and applied in one sled transaction on commit.
/// Reads through the transaction see its own uncommitted writes, so rules
/// evaluated mid-save observe the state that would be committed.
pub struct Transaction<'a> {
    engine: &'a StorageEngine,
    ops: Vec<TransactionOp>,
    /// Uncommitted writes per hierarchy: encoded key -> row (None = deleted).
    write_cache: HashMap<String, BTreeMap<Vec<u8>, Option<Value>>>,
}

impl<'a> Transaction<'a> {
    /// Create a new transaction.
    pub(crate) fn new(engine: &'a StorageEngine) -> Self {
        Self {
            engine,
            ops: Vec::new(),
            write_cache: HashMap::new(),
        }
    }

    /// Insert or replace a row.
    pub fn put(&mut self, root: &str, key: RowKey, row: Value) -> &mut Self {
        self.write_cache
            .entry(root.to_string())
            .or_default()
            .insert(key.encode(), Some(row.clone()));
        self.ops.push(TransactionOp::Put {
            root: root.to_string(),
            key,
            row,
        });
        self
    }

    /// Remove a row.
    pub fn delete(&mut self, root: &str, key: RowKey) -> &mut Self {
        self.write_cache
            .entry(root.to_string())
            .or_default()
            .insert(key.encode(), None);
        self.ops.push(TransactionOp::Delete {
            root: root.to_string(),
            key,
        });
        self
    }

    /// Check if a row exists, including uncommitted writes.
    pub fn exists(&self, root: &str, key: &RowKey) -> Result<bool, Error> {
        Ok(self.get(root, key)?.is_some())
    }

    /// Get all pending operations.
    pub fn operations(&self) -> &[TransactionOp] {
        &self.ops
    }

    /// Get the number of pending operations.
    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Commit the transaction atomically.
    ///
    /// All operations succeed or none do.
    pub fn commit(self) -> Result<(), Error> {
        if self.ops.is_empty() {
            return Ok(());
        }

        let mut roots: Vec<&str> = Vec::new();
        for op in &self.ops {
            if !roots.contains(&op.root()) {
                roots.push(op.root());
            }
        }
        let trees = roots
            .iter()
            .map(|root| self.engine.rows_tree(root))
            .collect::<Result<Vec<_>, _>>()?;

        // Encode up front so the transaction body cannot fail on serialization.
        let mut writes = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let tree = roots.iter().position(|r| *r == op.root()).unwrap_or(0);
            match op {
                TransactionOp::Put { key, row, .. } => {
                    writes.push((tree, key.encode(), Some(encode_row(row)?)))
                }
                TransactionOp::Delete { key, .. } => writes.push((tree, key.encode(), None)),
            }
        }

        let result: Result<(), TransactionError<Error>> =
            trees.as_slice().transaction(|views| {
                for (tree, key, value) in &writes {
                    let view = &views[*tree];
                    match value {
                        Some(bytes) => {
                            view.insert(key.as_slice(), bytes.as_slice())?;
                        }
                        None => {
                            view.remove(key.as_slice())?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<Error>>(())
            });

        match result {
            Ok(()) => {
                debug!(operations = self.ops.len(), trees = roots.len(), "transaction committed");
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Rollback the transaction (discard all pending operations).
    pub fn rollback(self) {
        debug!(operations = self.ops.len(), "transaction rolled back");
    }
}

impl RowSource for Transaction<'_> {
    fn scan(&self, root: &str) -> Result<Vec<Value>, Error> {
        let Some(cache) = self.write_cache.get(root) else {
            return self.engine.scan(root);
        };
        let mut merged: BTreeMap<Vec<u8>, Value> =
            self.engine.scan_entries(root)?.into_iter().collect();
        for (key, row) in cache {
            match row {
                Some(row) => {
                    merged.insert(key.clone(), row.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    fn get(&self, root: &str, key: &RowKey) -> Result<Option<Value>, Error> {
        if let Some(cached) = self
            .write_cache
            .get(root)
            .and_then(|cache| cache.get(&key.encode()))
        {
            return Ok(cached.clone());
        }
        self.engine.get(root, key)
    }
}

impl StorageEngine {
    /// Begin a new transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }
}
