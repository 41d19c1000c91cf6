//! Secured query entry point.
//!
//! [`QueryService`] ties the descriptor compiler, the filter injector and the
//! executor together: descriptors are compiled (and memoized), bound to the
//! request's parameters, secured for the principal and executed.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use warden_lang::{DescriptorCompiler, SchemaView, DEFAULT_CACHE_CAPACITY};
use warden_proto::{Page, QueryPlan, QueryRequest, QueryResult};

use super::executor::{IncludeStrategy, QueryExecutor, DEFAULT_MAX_INCLUDE_DEPTH};
use super::inject::{FilterInjector, SecuredPlan};
use crate::catalog::Catalog;
use crate::security::{Principal, RuleRegistry, SecurityError, SecurityResult};
use crate::storage::RowSource;

/// Compiles, secures and executes queries against one rule registry.
pub struct QueryService {
    registry: Arc<RuleRegistry>,
    compiler: DescriptorCompiler,
    include_strategy: IncludeStrategy,
    max_include_depth: usize,
}

impl QueryService {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self::with_compile_cache_capacity(registry, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a service whose compiler keeps at most `capacity` entries.
    pub fn with_compile_cache_capacity(registry: Arc<RuleRegistry>, capacity: usize) -> Self {
        let schema: Arc<dyn SchemaView + Send + Sync> = registry.catalog().clone();
        Self {
            compiler: DescriptorCompiler::with_capacity(schema, capacity),
            registry,
            include_strategy: IncludeStrategy::default(),
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        }
    }

    /// Strategy used when a request does not ask for split includes.
    pub fn with_include_strategy(mut self, strategy: IncludeStrategy) -> Self {
        self.include_strategy = strategy;
        self
    }

    pub fn with_max_include_depth(mut self, depth: usize) -> Self {
        self.max_include_depth = depth;
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.registry.catalog()
    }

    pub fn compiler(&self) -> &DescriptorCompiler {
        &self.compiler
    }

    /// Inject select rules into `plan` for `principal`.
    pub fn secure(&self, plan: &QueryPlan, principal: &Principal) -> SecurityResult<SecuredPlan> {
        FilterInjector::new(&self.registry, principal).secure(plan)
    }

    /// Secure and execute a plan.
    pub fn execute(
        &self,
        source: &dyn RowSource,
        plan: &QueryPlan,
        principal: &Principal,
        page: Option<Page>,
        cancel: &CancellationToken,
    ) -> SecurityResult<QueryResult> {
        self.run(source, plan, principal, page, self.include_strategy, cancel)
    }

    /// Compile a descriptor request, then secure and execute it.
    pub fn query(
        &self,
        source: &dyn RowSource,
        request: &QueryRequest,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> SecurityResult<QueryResult> {
        if cancel.is_cancelled() {
            return Err(SecurityError::Cancelled);
        }
        let compiled = self
            .compiler
            .compile(&request.entity, &request.descriptors, cancel)?;
        let plan = compiled.bind(&request.parameters())?;
        debug!(
            entity = %request.entity,
            descriptors = request.descriptors.len(),
            cached = self.compiler.len(),
            "compiled descriptor query"
        );

        let page = request
            .size
            .map(|size| Page::new(request.start.unwrap_or(0), size));
        let strategy = if request.split_includes {
            IncludeStrategy::Split
        } else {
            self.include_strategy
        };
        self.run(source, &plan, principal, page, strategy, cancel)
    }

    fn run(
        &self,
        source: &dyn RowSource,
        plan: &QueryPlan,
        principal: &Principal,
        page: Option<Page>,
        strategy: IncludeStrategy,
        cancel: &CancellationToken,
    ) -> SecurityResult<QueryResult> {
        let secured = self.secure(plan, principal)?;
        QueryExecutor::new(self.catalog(), source)
            .with_strategy(strategy)
            .with_max_include_depth(self.max_include_depth)
            .with_cancellation(cancel)
            .execute(&secured.plan, page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityType, FieldDef, NavigationDef, ScalarType};
    use crate::security::{PolicyRule, RuleSet};
    use crate::storage::engine::tests::row;
    use crate::storage::{RowKey, StorageConfig, StorageEngine};
    use warden_proto::{Descriptor, Value};

    fn service() -> QueryService {
        let catalog = Arc::new(
            Catalog::new(vec![EntityType::new("Folder")
                .with_key("Id", ScalarType::Int32)
                .with_field(FieldDef::new("OwnerId", ScalarType::Int32))
                .with_field(FieldDef::optional("ParentId", ScalarType::Int32))
                .with_navigation(NavigationDef::collection("Children", "Folder", "ParentId"))])
            .unwrap(),
        );
        let owner = PolicyRule::from("x => x.OwnerId == $principal".to_string())
            .compile(&catalog, "Folder")
            .unwrap();
        let registry = RuleRegistry::builder(catalog)
            .register("Folder", RuleSet::new().all(owner))
            .build()
            .unwrap();
        QueryService::new(Arc::new(registry))
    }

    fn engine() -> StorageEngine {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        for (id, owner) in [(4, 2), (7, 2), (12, 2), (15, 3)] {
            let value = row(
                "Folder",
                &[
                    ("Id", Value::Int32(id)),
                    ("OwnerId", Value::Int32(owner)),
                    ("ParentId", Value::Null),
                ],
            );
            let key = RowKey::from_values([value.field("Id").unwrap()]).unwrap();
            engine.put("Folder", &key, &value).unwrap();
        }
        engine
    }

    fn request(bound: i32) -> QueryRequest {
        QueryRequest::new("Folder")
            .with_descriptor(Descriptor::new("where", "x.Id > @0").with_param(bound))
            .with_descriptor(Descriptor::new("include", "Children"))
    }

    #[test]
    fn test_compiled_descriptors_are_reused() {
        let service = service();
        let engine = engine();
        let token = CancellationToken::new();
        let principal = Principal::new(2);

        let first = service.query(&engine, &request(5), &principal, &token).unwrap();
        assert_eq!(first.rows.len(), 2);
        let misses = service.compiler().stats().misses();

        let second = service.query(&engine, &request(10), &principal, &token).unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(service.compiler().stats().misses(), misses);
        assert!(service.compiler().stats().hits() >= 1);
        assert_eq!(service.compiler().len(), 1);
    }

    #[test]
    fn test_other_principal_sees_nothing() {
        let service = service();
        let engine = engine();
        let token = CancellationToken::new();
        let result = service
            .query(&engine, &request(5), &Principal::new(9), &token)
            .unwrap();
        assert!(result.rows.is_empty());
    }

    #[test]
    fn test_paged_request_reports_total() {
        let service = service();
        let engine = engine();
        let mut request = request(0);
        request.start = Some(1);
        request.size = Some(1);
        let result = service
            .query(&engine, &request, &Principal::new(2), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.total, Some(3));
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_cancelled_request() {
        let service = service();
        let engine = engine();
        let token = CancellationToken::new();
        token.cancel();
        let err = service
            .query(&engine, &request(5), &Principal::new(2), &token)
            .unwrap_err();
        assert!(matches!(err, SecurityError::Cancelled));
    }

    #[test]
    fn test_unknown_descriptor_operation() {
        let service = service();
        let engine = engine();
        let request = QueryRequest::new("Folder").with_descriptor(Descriptor::new("groupBy", "x.Id"));
        let err = service
            .query(&engine, &request, &Principal::new(2), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SecurityError::UnsupportedShape(_)));
    }
}
