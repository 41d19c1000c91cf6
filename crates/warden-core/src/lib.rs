//! Warden Core - row-level security for queries and saves.
//!
//! This crate provides the rule registry, filter injection, secured query
//! execution and the verified save pipeline, on top of a sled row store.

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod mutation;
pub mod query;
pub mod security;
pub mod storage;

pub use catalog::{Catalog, EntityType, FieldDef, Member, NavigationDef, NavigationKind, ScalarType};
pub use config::EngineConfig;
pub use database::{Database, PayloadSave};
pub use error::Error;
pub use storage::{RowKey, RowSource, StorageConfig, StorageEngine, Transaction};

// Query exports
pub use query::{FilterInjector, IncludeStrategy, QueryExecutor, QueryService, SecuredPlan};

// Mutation exports
pub use mutation::{
    ChangeTracker, EntityHandle, EntityState, HookContext, HookRegistry, MutationHooks,
    SaveOutcome, SavePipeline, TrackedEntity,
};

// Graph exports
pub use graph::{GraphBuilder, Serializer};

// Security exports
pub use security::{
    FieldError, IgnoreCondition, Operation, PolicyRule, Principal, RuleRegistry, RuleSet,
    SecurityError, SecurityResult, SecurityRule,
};

/// Re-export protocol types.
pub use warden_proto as proto;
