//! Descriptor list compiler with a memoized result cache.
//!
//! A descriptor list compiles into a [`CompiledQuery`]: the list of plan
//! operations with positional parameters left symbolic. Values are bound per
//! call, so requests that differ only in parameter values share one entry.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_proto::{
    Descriptor, DescriptorOp, Expr, Lambda, QueryOp, QueryPlan, Value, ValueKind,
};

use crate::ast::{Node, NodeKind};
use crate::binder::{BindOptions, BindType, Binder, MemberKind, SchemaView, IMPLICIT_PARAM};
use crate::error::{CompileError, LangError};
use crate::parser::parse;
use crate::span::Span;

/// Default number of compiled descriptor lists kept.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Cache key: root type, descriptor signature and parameter kinds.
///
/// Parameter values are deliberately absent; only their kinds affect
/// binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompileKey {
    entity: String,
    steps: Vec<(String, String, Vec<ValueKind>)>,
}

impl CompileKey {
    /// Build the key for a descriptor list.
    pub fn new(entity: &str, descriptors: &[Descriptor]) -> Self {
        Self {
            entity: entity.to_string(),
            steps: descriptors
                .iter()
                .map(|d| {
                    (
                        d.operation.clone(),
                        d.expression.clone(),
                        d.parameters.iter().map(Value::kind).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

/// A compiled descriptor list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    root: String,
    ops: Vec<QueryOp>,
    param_count: usize,
}

impl CompiledQuery {
    /// Root entity type.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Operations with symbolic parameters.
    pub fn ops(&self) -> &[QueryOp] {
        &self.ops
    }

    /// Number of positional values expected by [`bind`](Self::bind).
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Bind parameter values, producing a plan over the root type.
    pub fn bind(&self, params: &[Value]) -> Result<QueryPlan, LangError> {
        self.apply(&QueryPlan::new(self.root.clone()), params)
    }

    /// Append the bound operations to an existing plan.
    pub fn apply(&self, base: &QueryPlan, params: &[Value]) -> Result<QueryPlan, LangError> {
        if params.len() != self.param_count {
            return Err(LangError::ParameterCount {
                expected: self.param_count,
                actual: params.len(),
            });
        }
        let bound = QueryPlan::from_ops(self.root.clone(), self.ops.clone()).bind_params(params)?;
        Ok(base.extend(bound.into_ops()))
    }
}

/// A cache entry with its hit counter.
#[derive(Debug)]
struct CachedQuery {
    query: Arc<CompiledQuery>,
    hit_count: AtomicU64,
}

impl CachedQuery {
    fn new(query: Arc<CompiledQuery>) -> Self {
        Self {
            query,
            hit_count: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) -> u64 {
        self.hit_count.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    fn hits(&self) -> u64 {
        self.hit_count.load(AtomicOrdering::Relaxed)
    }
}

/// Compiler statistics.
#[derive(Debug, Default)]
pub struct CompilerStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    failures: AtomicU64,
}

impl CompilerStats {
    /// Lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Lookups that required a compile.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Entries evicted for capacity.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Compiles that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(AtomicOrdering::Relaxed)
    }

    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Compiles descriptor lists and memoizes the results.
///
/// Safe for concurrent use. Two callers compiling the same key for the first
/// time may both do the work; the first entry inserted is kept and returned
/// to both.
pub struct DescriptorCompiler {
    schema: Arc<dyn SchemaView + Send + Sync>,
    cache: DashMap<CompileKey, CachedQuery>,
    max_entries: usize,
    stats: CompilerStats,
}

impl DescriptorCompiler {
    /// Create a compiler with the default cache capacity.
    pub fn new(schema: Arc<dyn SchemaView + Send + Sync>) -> Self {
        Self::with_capacity(schema, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a compiler keeping at most `max_entries` compiled lists.
    pub fn with_capacity(schema: Arc<dyn SchemaView + Send + Sync>, max_entries: usize) -> Self {
        Self {
            schema,
            cache: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: CompilerStats::default(),
        }
    }

    /// Compile (or fetch) the descriptor list for `entity`.
    ///
    /// A failed compile leaves nothing in the cache. A cancelled compile
    /// returns [`LangError::Cancelled`] and inserts nothing.
    pub fn compile(
        &self,
        entity: &str,
        descriptors: &[Descriptor],
        cancel: &CancellationToken,
    ) -> Result<Arc<CompiledQuery>, LangError> {
        let key = CompileKey::new(entity, descriptors);

        if let Some(cached) = self.cache.get(&key) {
            cached.record_hit();
            self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(cached.query.clone());
        }
        self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);

        let compiled = match self.compile_uncached(entity, descriptors, cancel) {
            Ok(compiled) => compiled,
            Err(LangError::Cancelled) => {
                debug!(entity, "descriptor compile cancelled");
                return Err(LangError::Cancelled);
            }
            Err(err) => {
                self.stats.failures.fetch_add(1, AtomicOrdering::Relaxed);
                self.cache.remove(&key);
                warn!(entity, error = %err, "descriptor compile failed");
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            return Err(LangError::Cancelled);
        }

        if self.cache.len() >= self.max_entries && !self.cache.contains_key(&key) {
            self.evict_least_used();
        }

        let entry = self
            .cache
            .entry(key)
            .or_insert_with(|| CachedQuery::new(Arc::new(compiled)));
        debug!(
            entity,
            descriptors = descriptors.len(),
            ops = entry.query.ops.len(),
            "compiled descriptor list"
        );
        Ok(entry.query.clone())
    }

    /// Whether a compiled entry exists for this descriptor list.
    pub fn is_cached(&self, entity: &str, descriptors: &[Descriptor]) -> bool {
        self.cache.contains_key(&CompileKey::new(entity, descriptors))
    }

    /// Drop every entry rooted at `entity`.
    pub fn invalidate_entity(&self, entity: &str) {
        self.cache.retain(|key, _| key.entity() != entity);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> &CompilerStats {
        &self.stats
    }

    /// Evict the entry with the fewest hits.
    fn evict_least_used(&self) {
        let victim = self
            .cache
            .iter()
            .min_by_key(|entry| entry.value().hits())
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            self.cache.remove(&key);
            self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    fn compile_uncached(
        &self,
        entity: &str,
        descriptors: &[Descriptor],
        cancel: &CancellationToken,
    ) -> Result<CompiledQuery, LangError> {
        if !self.schema.has_entity(entity) {
            return Err(CompileError::unknown_entity(entity, Span::default()).into());
        }

        let mut state = CompileState {
            element: BindType::Entity(entity.to_string()),
            include_tail: None,
            ordered: false,
            ops: Vec::new(),
        };
        let mut offset = 0;

        for (index, descriptor) in descriptors.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LangError::Cancelled);
            }
            let op = descriptor
                .op()
                .map_err(LangError::UnsupportedOperation)?;
            self.compile_step(&mut state, op, descriptor, offset)
                .map_err(|err| {
                    err.in_descriptor(index, &descriptor.operation, &descriptor.expression)
                })?;
            offset += descriptor.parameters.len();
        }

        Ok(CompiledQuery {
            root: entity.to_string(),
            ops: state.ops,
            param_count: offset,
        })
    }

    fn compile_step(
        &self,
        state: &mut CompileState,
        op: DescriptorOp,
        descriptor: &Descriptor,
        offset: usize,
    ) -> Result<(), LangError> {
        let node = parse(&descriptor.expression)?;
        let kinds: Vec<ValueKind> = descriptor.parameters.iter().map(Value::kind).collect();
        let mut binder = Binder::new(self.schema.as_ref(), &kinds).with_param_offset(offset);

        match op {
            DescriptorOp::Where => {
                let (lambda, ty) = binder.bind_lambda(&node, &state.element)?;
                if !matches!(ty, BindType::Scalar | BindType::Unknown) {
                    return Err(CompileError::type_mismatch(
                        "a boolean predicate",
                        &format!("{:?}", ty),
                        node.span,
                    )
                    .into());
                }
                state.ops.push(QueryOp::Where(lambda));
            }
            DescriptorOp::Select => {
                let (lambda, ty) = binder.bind_lambda(&node, &state.element)?;
                state.element = match ty {
                    BindType::Entity(entity) => BindType::Entity(entity),
                    _ => BindType::Unknown,
                };
                state.include_tail = None;
                state.ordered = false;
                state.ops.push(QueryOp::Select(lambda));
            }
            DescriptorOp::OrderBy | DescriptorOp::OrderByDescending => {
                let (key, _) = binder.bind_lambda(&node, &state.element)?;
                state.ordered = true;
                state.ops.push(QueryOp::OrderBy {
                    key,
                    descending: op == DescriptorOp::OrderByDescending,
                });
            }
            DescriptorOp::ThenBy | DescriptorOp::ThenByDescending => {
                if !state.ordered {
                    return Err(CompileError::invalid_query(
                        format!("'{}' requires a preceding orderBy", op),
                        node.span,
                    )
                    .into());
                }
                let (key, _) = binder.bind_lambda(&node, &state.element)?;
                state.ops.push(QueryOp::ThenBy {
                    key,
                    descending: op == DescriptorOp::ThenByDescending,
                });
            }
            DescriptorOp::Include => {
                let BindType::Entity(entity) = state.element.clone() else {
                    return Err(CompileError::invalid_query(
                        "include requires entity rows",
                        node.span,
                    )
                    .into());
                };
                let (lambdas, tail) = self.include_path(&mut binder, &node, &entity)?;
                for (i, lambda) in lambdas.into_iter().enumerate() {
                    state.ops.push(if i == 0 {
                        QueryOp::Include(lambda)
                    } else {
                        QueryOp::ThenInclude(lambda)
                    });
                }
                state.include_tail = Some(tail);
            }
            DescriptorOp::ThenInclude => {
                let Some(entity) = state.include_tail.clone() else {
                    return Err(CompileError::invalid_query(
                        "thenInclude requires a preceding include",
                        node.span,
                    )
                    .into());
                };
                let (lambdas, tail) = self.include_path(&mut binder, &node, &entity)?;
                state
                    .ops
                    .extend(lambdas.into_iter().map(QueryOp::ThenInclude));
                state.include_tail = Some(tail);
            }
        }
        Ok(())
    }

    /// Compile an include text into one lambda per collection hop.
    ///
    /// `Children.Items` becomes `it => it.Children` then `it => it.Items`.
    /// Texts that are not plain member paths (filtered includes) compile to
    /// a single lambda.
    fn include_path(
        &self,
        binder: &mut Binder<'_>,
        node: &Node,
        entity: &str,
    ) -> Result<(Vec<Lambda>, String), LangError> {
        if let Some(segments) = self.member_path(node, entity) {
            return self.split_path(&segments, entity);
        }

        let (lambda, ty) = binder.bind_lambda(node, &BindType::Entity(entity.to_string()))?;
        match ty {
            BindType::Entity(tail) | BindType::Entities(tail) => Ok((vec![lambda], tail)),
            other => Err(CompileError::invalid_query(
                format!("include path must end in a navigation, found {:?}", other),
                node.span,
            )
            .into()),
        }
    }

    /// Member names of a plain path, relative to the lambda parameter.
    fn member_path(&self, node: &Node, entity: &str) -> Option<Vec<(String, Span)>> {
        let (explicit_param, body) = match &node.kind {
            NodeKind::Lambda { param, body } => (Some(param.value.as_str()), body.as_ref()),
            _ => (None, node),
        };

        let mut segments = Vec::new();
        let mut current = body;
        loop {
            match &current.kind {
                NodeKind::Member { target, name } => {
                    segments.push((name.value.clone(), name.span));
                    current = target;
                }
                NodeKind::Ident(root) => {
                    match explicit_param {
                        Some(param) if param == root => {}
                        Some(_) => return None,
                        None => {
                            if self.schema.member(entity, root).is_some() {
                                segments.push((root.clone(), current.span));
                            }
                        }
                    }
                    break;
                }
                _ => return None,
            }
        }
        segments.reverse();
        if segments.is_empty() {
            None
        } else {
            Some(segments)
        }
    }

    fn split_path(
        &self,
        segments: &[(String, Span)],
        entity: &str,
    ) -> Result<(Vec<Lambda>, String), LangError> {
        let mut lambdas = Vec::new();
        let mut body = Expr::var(IMPLICIT_PARAM);
        let mut current = entity.to_string();

        for (i, (name, name_span)) in segments.iter().enumerate() {
            let kind = self.schema.member(&current, name).ok_or_else(|| {
                CompileError::unknown_member(&current, name, *name_span)
            })?;
            body = body.member(name.clone());
            match kind {
                MemberKind::Scalar => {
                    return Err(CompileError::invalid_query(
                        format!("'{}' is not a navigation", name),
                        *name_span,
                    )
                    .with_hint("include paths name reference or collection navigations")
                    .into());
                }
                MemberKind::Reference(target) => current = target,
                MemberKind::Collection(target) => {
                    current = target;
                    if i + 1 < segments.len() {
                        let finished = std::mem::replace(&mut body, Expr::var(IMPLICIT_PARAM));
                        lambdas.push(Lambda::new(IMPLICIT_PARAM, finished));
                    }
                }
            }
        }
        lambdas.push(Lambda::new(IMPLICIT_PARAM, body));
        Ok((lambdas, current))
    }
}

struct CompileState {
    /// Element type of the rows flowing out of the ops so far.
    element: BindType,
    /// Entity type at the end of the last include path.
    include_tail: Option<String>,
    /// Whether an orderBy has been applied since the last projection.
    ordered: bool,
    ops: Vec<QueryOp>,
}

/// Compile a rule predicate such as `x => x.OwnerId == $principal`.
///
/// Rule texts may reference `$principal` but take no positional parameters.
pub fn compile_predicate(
    schema: &dyn SchemaView,
    entity: &str,
    text: &str,
) -> Result<Lambda, LangError> {
    if !schema.has_entity(entity) {
        return Err(CompileError::unknown_entity(entity, Span::default()).into());
    }
    let node = parse(text)?;
    let (lambda, ty) = Binder::new(schema, &[])
        .with_options(BindOptions {
            allow_principal: true,
        })
        .bind_lambda(&node, &BindType::Entity(entity.to_string()))?;
    if !matches!(ty, BindType::Scalar | BindType::Unknown) {
        return Err(
            CompileError::type_mismatch("a boolean predicate", &format!("{:?}", ty), node.span)
                .into(),
        );
    }
    Ok(lambda)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::tests::TestSchema;
    use crate::error::CompileErrorKind;
    use pretty_assertions::assert_eq;
    use warden_proto::Method;

    fn compiler() -> DescriptorCompiler {
        DescriptorCompiler::new(Arc::new(TestSchema::new()))
    }

    fn scenario_c(value: i32) -> Vec<Descriptor> {
        vec![
            Descriptor::new("where", "x.Id > @0").with_param(value),
            Descriptor::new("include", "Children"),
        ]
    }

    #[test]
    fn test_compile_once_reuse_with_new_values() {
        let compiler = compiler();
        let token = CancellationToken::new();

        let first = compiler.compile("Folder", &scenario_c(5), &token).unwrap();
        let second = compiler.compile("Folder", &scenario_c(10), &token).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.stats().misses(), 1);
        assert_eq!(compiler.stats().hits(), 1);
        assert_eq!(compiler.len(), 1);

        let plan = second.bind(&[Value::Int32(10)]).unwrap();
        match &plan.ops()[0] {
            QueryOp::Where(lambda) => assert_eq!(
                *lambda.body,
                Expr::var(IMPLICIT_PARAM).member("Id").gt(Expr::lit(10))
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(plan.ops()[1], QueryOp::Include(_)));
    }

    #[test]
    fn test_param_kind_is_part_of_key() {
        let compiler = compiler();
        let token = CancellationToken::new();
        compiler.compile("Folder", &scenario_c(5), &token).unwrap();
        let as_string = vec![
            Descriptor::new("where", "x.Id > @0").with_param("5"),
            Descriptor::new("include", "Children"),
        ];
        compiler.compile("Folder", &as_string, &token).unwrap();
        assert_eq!(compiler.len(), 2);
    }

    #[test]
    fn test_params_are_renumbered_across_descriptors() {
        let compiler = compiler();
        let descriptors = vec![
            Descriptor::new("where", "x.Id > @0").with_param(1),
            Descriptor::new("where", "x.Name == @0").with_param("a"),
        ];
        let compiled = compiler
            .compile("Folder", &descriptors, &CancellationToken::new())
            .unwrap();
        assert_eq!(compiled.param_count(), 2);

        let plan = compiled
            .bind(&[Value::Int32(1), Value::String("a".into())])
            .unwrap();
        match &plan.ops()[1] {
            QueryOp::Where(lambda) => assert_eq!(
                *lambda.body,
                Expr::var(IMPLICIT_PARAM).member("Name").eq(Expr::lit("a"))
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bind_checks_parameter_count() {
        let compiled = compiler()
            .compile("Folder", &scenario_c(5), &CancellationToken::new())
            .unwrap();
        assert!(matches!(
            compiled.bind(&[]),
            Err(LangError::ParameterCount {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let compiler = compiler();
        let bad = vec![Descriptor::new("where", "x.Nope > 1")];
        let err = compiler
            .compile("Folder", &bad, &CancellationToken::new())
            .unwrap_err();
        match err.root_cause() {
            LangError::Compile(e) => assert_eq!(e.kind, CompileErrorKind::UnknownMember),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!compiler.is_cached("Folder", &bad));
        assert_eq!(compiler.stats().failures(), 1);
    }

    #[test]
    fn test_unknown_operation() {
        let err = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("explode", "x")],
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, LangError::UnsupportedOperation(ref name) if name == "explode"));
    }

    #[test]
    fn test_unknown_root_entity() {
        let err = compiler()
            .compile("Ghost", &[], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, LangError::Compile(ref e) if e.kind == CompileErrorKind::UnknownEntity));
    }

    #[test]
    fn test_cancelled_compile_inserts_nothing() {
        let compiler = compiler();
        let token = CancellationToken::new();
        token.cancel();
        let err = compiler
            .compile("Folder", &scenario_c(5), &token)
            .unwrap_err();
        assert!(matches!(err, LangError::Cancelled));
        assert!(compiler.is_empty());
        assert_eq!(compiler.stats().failures(), 0);
    }

    #[test]
    fn test_include_path_is_split_at_collections() {
        let compiled = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("include", "Children.Items.Folder")],
                &CancellationToken::new(),
            )
            .unwrap();
        let ops = compiled.ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0],
            QueryOp::Include(Lambda::new(
                IMPLICIT_PARAM,
                Expr::var(IMPLICIT_PARAM).member("Children")
            ))
        );
        assert_eq!(
            ops[1],
            QueryOp::ThenInclude(Lambda::new(
                IMPLICIT_PARAM,
                Expr::var(IMPLICIT_PARAM).member("Items")
            ))
        );
        assert_eq!(
            ops[2],
            QueryOp::ThenInclude(Lambda::new(
                IMPLICIT_PARAM,
                Expr::var(IMPLICIT_PARAM).member("Folder")
            ))
        );
    }

    #[test]
    fn test_then_include_continues_from_tail() {
        let compiled = compiler()
            .compile(
                "Folder",
                &[
                    Descriptor::new("include", "x => x.Items"),
                    Descriptor::new("thenInclude", "i => i.Folder"),
                ],
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(matches!(compiled.ops()[1], QueryOp::ThenInclude(_)));
    }

    #[test]
    fn test_then_include_without_include_fails() {
        let err = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("thenInclude", "Items")],
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, LangError::Descriptor { index: 0, .. }));
    }

    #[test]
    fn test_filtered_include() {
        let compiled = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("include", "x => x.Children.Where(c => c.Id > 1)")],
                &CancellationToken::new(),
            )
            .unwrap();
        match &compiled.ops()[0] {
            QueryOp::Include(lambda) => assert!(matches!(
                *lambda.body,
                Expr::Call {
                    method: Method::Where,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_include_of_scalar_fails() {
        let err = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("include", "Name")],
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err.root_cause(), LangError::Compile(e) if e.kind == CompileErrorKind::InvalidQuery));
    }

    #[test]
    fn test_then_by_requires_order_by() {
        let err = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("thenBy", "x.Name")],
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("orderBy"));
    }

    #[test]
    fn test_principal_rejected_in_descriptors() {
        let err = compiler()
            .compile(
                "Folder",
                &[Descriptor::new("where", "x.OwnerId == $principal")],
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("$principal"));
    }

    #[test]
    fn test_eviction_at_capacity() {
        let compiler = DescriptorCompiler::with_capacity(Arc::new(TestSchema::new()), 2);
        let token = CancellationToken::new();
        let a = vec![Descriptor::new("where", "x.Id > 1")];
        let b = vec![Descriptor::new("where", "x.Id > 2")];
        let c = vec![Descriptor::new("where", "x.Id > 3")];

        compiler.compile("Folder", &a, &token).unwrap();
        compiler.compile("Folder", &a, &token).unwrap();
        compiler.compile("Folder", &b, &token).unwrap();
        compiler.compile("Folder", &c, &token).unwrap();

        assert_eq!(compiler.len(), 2);
        assert_eq!(compiler.stats().evictions(), 1);
        assert!(compiler.is_cached("Folder", &a));
        assert!(!compiler.is_cached("Folder", &b));
    }

    #[test]
    fn test_invalidate_entity() {
        let compiler = compiler();
        let token = CancellationToken::new();
        compiler.compile("Folder", &scenario_c(1), &token).unwrap();
        compiler
            .compile("Item", &[Descriptor::new("where", "x.Id > 1")], &token)
            .unwrap();
        compiler.invalidate_entity("Folder");
        assert_eq!(compiler.len(), 1);
        assert!(compiler.stats().hit_rate() < 0.01);
    }

    #[test]
    fn test_compile_predicate_with_principal() {
        let schema = TestSchema::new();
        let lambda = compile_predicate(&schema, "Folder", "x => x.OwnerId == $principal").unwrap();
        assert_eq!(
            *lambda.body,
            Expr::var("x").member("OwnerId").eq(Expr::Principal)
        );
        assert!(compile_predicate(&schema, "Folder", "x => x.Children").is_err());
    }
}
