//! Engine configuration.

use std::path::PathBuf;

use crate::query::{IncludeStrategy, DEFAULT_MAX_INCLUDE_DEPTH};
use crate::storage::StorageConfig;

/// Default number of compiled descriptor lists kept per database.
pub const DEFAULT_COMPILE_CACHE_CAPACITY: usize = warden_lang::DEFAULT_CACHE_CAPACITY;

/// Default data directory.
pub const DEFAULT_DATA_PATH: &str = "./warden_data";

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage engine settings.
    pub storage: StorageConfig,

    /// Maximum number of compiled descriptor lists kept in memory.
    pub compile_cache_capacity: usize,

    /// Include loading strategy for requests that do not choose one.
    pub include_strategy: IncludeStrategy,

    /// Deepest include path a query may request.
    pub max_include_depth: usize,
}

impl EngineConfig {
    /// Create a configuration storing data under `data_path`.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self::with_storage(StorageConfig::new(data_path))
    }

    /// Create a configuration backed by a temporary database.
    pub fn temporary() -> Self {
        Self::with_storage(StorageConfig::temporary())
    }

    fn with_storage(storage: StorageConfig) -> Self {
        Self {
            storage,
            compile_cache_capacity: DEFAULT_COMPILE_CACHE_CAPACITY,
            include_strategy: IncludeStrategy::default(),
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        }
    }

    /// Set the compiled descriptor cache capacity.
    pub fn with_compile_cache_capacity(mut self, capacity: usize) -> Self {
        self.compile_cache_capacity = capacity.max(1);
        self
    }

    /// Set the default include strategy.
    pub fn with_include_strategy(mut self, strategy: IncludeStrategy) -> Self {
        self.include_strategy = strategy;
        self
    }

    /// Set the maximum include depth.
    pub fn with_max_include_depth(mut self, depth: usize) -> Self {
        self.max_include_depth = depth;
        self
    }

    /// Flush every write to disk before returning.
    pub fn with_sync_writes(mut self) -> Self {
        self.storage = self.storage.with_sync_writes();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_PATH)
    }
}
