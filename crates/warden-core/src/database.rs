//! Database facade combining storage, rules, queries and saves.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use warden_proto::{Page, QueryPlan, QueryRequest, QueryResult, Value};

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::graph::{GraphBuilder, Serializer};
use crate::mutation::{ChangeTracker, EntityHandle, HookRegistry, SaveOutcome, SavePipeline};
use crate::query::QueryService;
use crate::security::{Principal, RuleRegistry, SecurityResult};
use crate::storage::StorageEngine;

/// Result of saving a JSON payload.
#[derive(Debug)]
pub struct PayloadSave {
    /// Root entities built from the payload, with generated keys filled in.
    pub roots: Vec<EntityHandle>,
    pub outcome: SaveOutcome,
}

/// A secured database: every query is filtered and every save verified
/// against one rule registry.
pub struct Database {
    storage: Arc<StorageEngine>,
    registry: Arc<RuleRegistry>,
    service: QueryService,
    pipeline: SavePipeline,
}

impl Database {
    /// Open the storage described by `config` and secure it with `registry`.
    pub fn open(registry: Arc<RuleRegistry>, config: EngineConfig) -> Result<Self, Error> {
        let storage = Arc::new(StorageEngine::open(config.storage.clone())?);
        let service = QueryService::with_compile_cache_capacity(registry.clone(), config.compile_cache_capacity)
            .with_include_strategy(config.include_strategy)
            .with_max_include_depth(config.max_include_depth);
        let pipeline = SavePipeline::new(registry.clone(), storage.clone());
        info!(
            path = %config.storage.path.display(),
            temporary = config.storage.temporary,
            recovered = storage.was_recovered(),
            entities = registry.catalog().entity_names().count(),
            "database opened"
        );
        Ok(Self {
            storage,
            registry,
            service,
            pipeline,
        })
    }

    /// Replace the mutation hooks.
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.pipeline = self.pipeline.with_hooks(hooks);
        self
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn storage_arc(&self) -> Arc<StorageEngine> {
        self.storage.clone()
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.registry.catalog()
    }

    pub fn service(&self) -> &QueryService {
        &self.service
    }

    pub fn pipeline(&self) -> &SavePipeline {
        &self.pipeline
    }

    /// Run a descriptor request as `principal`.
    pub fn query(
        &self,
        request: &QueryRequest,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> SecurityResult<QueryResult> {
        self.service.query(self.storage.as_ref(), request, principal, cancel)
    }

    /// Run a query plan as `principal`.
    pub fn execute(
        &self,
        plan: &QueryPlan,
        principal: &Principal,
        page: Option<Page>,
        cancel: &CancellationToken,
    ) -> SecurityResult<QueryResult> {
        self.service
            .execute(self.storage.as_ref(), plan, principal, page, cancel)
    }

    /// Save the pending changes of `tracker` as `principal`.
    pub fn save(&self, tracker: ChangeTracker, principal: &Principal) -> SecurityResult<SaveOutcome> {
        self.pipeline.save(tracker, principal)
    }

    /// Build entities of type `entity` from a JSON payload and save them.
    pub fn save_payload(
        &self,
        entity: &str,
        payload: &serde_json::Value,
        principal: &Principal,
    ) -> SecurityResult<PayloadSave> {
        let tracker = ChangeTracker::new();
        let roots = GraphBuilder::new(&self.registry, self.storage.as_ref(), &tracker).build(entity, payload)?;
        let outcome = self.pipeline.save(tracker, principal)?;
        Ok(PayloadSave { roots, outcome })
    }

    pub fn serializer(&self) -> Serializer<'_> {
        Serializer::new(&self.registry)
    }

    /// Serialize result rows with ignore metadata and shared references.
    pub fn to_json(&self, result: &QueryResult) -> serde_json::Value {
        self.serializer().rows_to_json(&result.rows)
    }

    /// Serialize a single value.
    pub fn value_to_json(&self, value: &Value) -> serde_json::Value {
        self.serializer().to_json(value)
    }
}
