//! Query executor for running secured plans.
//!
//! The executor scans the root hierarchy, applies the plan's operations,
//! pages the result and then eager-loads the include tree for entity rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warden_proto::{Page, QueryPlan, QueryResult, Value};

use super::eval::Evaluator;
use super::include::{IncludeNode, IncludeTree};
use crate::catalog::{Catalog, NavigationKind};
use crate::error::Error;
use crate::security::{SecurityError, SecurityResult};
use crate::storage::{RowKey, RowSource};

/// Default limit on include nesting.
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 8;

/// How included navigations are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncludeStrategy {
    /// Load each parent's navigation separately - one lookup per row,
    /// cheapest for small pages.
    #[default]
    PerRow,
    /// Load one include level for all parents at once: scan the target
    /// hierarchy once, group by join key, then probe per parent.
    Split,
}

impl IncludeStrategy {
    /// Pick a strategy from the number of parent rows on the first level.
    pub fn select(parent_count: usize) -> Self {
        if parent_count > 100 {
            IncludeStrategy::Split
        } else {
            IncludeStrategy::PerRow
        }
    }
}

/// Query executor that runs plans against a row source.
///
/// Plans must come from the filter injector: every include hop that opens a
/// new path has to carry a guard, or execution fails.
pub struct QueryExecutor<'a> {
    catalog: &'a Catalog,
    source: &'a dyn RowSource,
    strategy: IncludeStrategy,
    max_include_depth: usize,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> QueryExecutor<'a> {
    /// Create a new executor with catalog and source references.
    pub fn new(catalog: &'a Catalog, source: &'a dyn RowSource) -> Self {
        Self {
            catalog,
            source,
            strategy: IncludeStrategy::default(),
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            cancel: None,
        }
    }

    pub fn with_strategy(mut self, strategy: IncludeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_include_depth(mut self, depth: usize) -> Self {
        self.max_include_depth = depth;
        self
    }

    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn evaluator(&self) -> Evaluator<'a> {
        let eval = Evaluator::new(self.catalog, self.source);
        match self.cancel {
            Some(cancel) => eval.with_cancellation(cancel),
            None => eval,
        }
    }

    fn check_cancelled(&self) -> SecurityResult<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(SecurityError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Execute a plan over every row of its root type.
    ///
    /// With a page, `total` is the row count before paging.
    pub fn execute(&self, plan: &QueryPlan, page: Option<Page>) -> SecurityResult<QueryResult> {
        let root = plan.root();
        let storage_root = self
            .catalog
            .root_of(root)
            .ok_or_else(|| Error::UnknownEntity(root.to_string()))?;
        let eval = self.evaluator();
        let rows = self
            .source
            .scan(storage_root)?
            .into_iter()
            .filter(|row| eval.is_instance(row, root))
            .collect();
        self.run(plan, rows, page)
    }

    /// Execute a plan over explicit rows instead of a scan. Navigations
    /// are still loaded from the source.
    pub fn execute_on(&self, plan: &QueryPlan, rows: Vec<Value>) -> SecurityResult<QueryResult> {
        self.run(plan, rows, None)
    }

    fn run(
        &self,
        plan: &QueryPlan,
        rows: Vec<Value>,
        page: Option<Page>,
    ) -> SecurityResult<QueryResult> {
        self.check_cancelled()?;
        let tree = IncludeTree::build(self.catalog, plan.root(), plan.ops(), self.max_include_depth)?;
        let eval = self.evaluator();

        let mut rows = eval.apply_ops(rows, plan.ops())?;
        let total = page.map(|_| rows.len());
        if let Some(page) = page {
            rows = rows.into_iter().skip(page.start).take(page.size).collect();
        }

        if plan.yields_entities() && !tree.is_empty() {
            self.attach(&mut rows, &tree.roots, &eval)?;
        }

        debug!(
            root = plan.root(),
            rows = rows.len(),
            total = ?total,
            strategy = ?self.strategy,
            "executed query"
        );
        Ok(QueryResult { rows, total })
    }

    /// Load `nodes` for every row and store them under the navigation name.
    fn attach(
        &self,
        rows: &mut [Value],
        nodes: &[IncludeNode],
        eval: &Evaluator<'_>,
    ) -> SecurityResult<()> {
        for node in nodes {
            self.check_cancelled()?;
            let loaded = match self.strategy {
                IncludeStrategy::PerRow => self.load_per_row(rows, node, eval)?,
                IncludeStrategy::Split => self.load_split(rows, node, eval)?,
            };

            let mut counts = Vec::with_capacity(loaded.len());
            let mut flat = Vec::new();
            for group in loaded {
                let group = eval.apply_ops(group, &node.ops)?;
                counts.push(group.len());
                flat.extend(group);
            }
            if !node.children.is_empty() {
                self.attach(&mut flat, &node.children, eval)?;
            }

            let mut flat = flat.into_iter();
            for (row, count) in rows.iter_mut().zip(counts) {
                let group: Vec<Value> = flat.by_ref().take(count).collect();
                let value = if node.navigation.is_collection() {
                    Value::List(group)
                } else {
                    group.into_iter().next().unwrap_or(Value::Null)
                };
                if let Some(map) = row.as_object_mut() {
                    map.insert(node.name.clone(), value);
                }
            }
        }
        Ok(())
    }

    fn load_per_row(
        &self,
        rows: &[Value],
        node: &IncludeNode,
        eval: &Evaluator<'_>,
    ) -> SecurityResult<Vec<Vec<Value>>> {
        rows.iter()
            .map(|row| {
                if row.entity_type().is_none() {
                    return Ok(Vec::new());
                }
                Ok(match eval.load_navigation(row, &node.navigation)? {
                    Value::List(items) => items,
                    Value::Null => Vec::new(),
                    single => vec![single],
                })
            })
            .collect()
    }

    fn load_split(
        &self,
        rows: &[Value],
        node: &IncludeNode,
        eval: &Evaluator<'_>,
    ) -> SecurityResult<Vec<Vec<Value>>> {
        let navigation = &node.navigation;
        let target_root = self
            .catalog
            .root_of(&navigation.target)
            .ok_or_else(|| Error::UnknownEntity(navigation.target.clone()))?;

        // Build phase: one scan of the target hierarchy.
        let mut index: HashMap<Vec<u8>, Vec<Value>> = HashMap::new();
        for candidate in self.source.scan(target_root)? {
            if !eval.is_instance(&candidate, &navigation.target) {
                continue;
            }
            let key = match &navigation.kind {
                NavigationKind::Reference { .. } => self.catalog.key_of(&navigation.target, &candidate),
                NavigationKind::Collection { inverse_key } => candidate
                    .field(inverse_key)
                    .and_then(|fk| RowKey::from_values([fk])),
            };
            if let Some(key) = key {
                index.entry(key.encode()).or_default().push(candidate);
            }
        }

        // Probe phase: one lookup per parent.
        let probe = |row: &Value| -> Option<RowKey> {
            match &navigation.kind {
                NavigationKind::Reference { foreign_key } => {
                    row.field(foreign_key).and_then(|fk| RowKey::from_values([fk]))
                }
                NavigationKind::Collection { .. } => {
                    let owner = row.entity_type()?;
                    let key = self.catalog.single_key(owner)?;
                    row.field(&key.name).and_then(|v| RowKey::from_values([v]))
                }
            }
        };
        Ok(rows
            .iter()
            .map(|row| {
                probe(row)
                    .and_then(|key| index.get(&key.encode()).cloned())
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityType, FieldDef, NavigationDef, ScalarType};
    use crate::query::include::{Guard, IncludeHop, IncludePath};
    use crate::storage::engine::tests::row;
    use crate::storage::{StorageConfig, StorageEngine};
    use warden_proto::{Expr, Lambda, QueryOp};

    fn catalog() -> Catalog {
        Catalog::new(vec![
            EntityType::new("Folder")
                .with_key("Id", ScalarType::Int32)
                .with_field(FieldDef::new("OwnerId", ScalarType::Int32))
                .with_field(FieldDef::optional("ParentId", ScalarType::Int32))
                .with_navigation(NavigationDef::collection("Children", "Folder", "ParentId"))
                .with_navigation(NavigationDef::reference("Parent", "Folder", "ParentId"))
                .with_navigation(NavigationDef::collection("Items", "Item", "FolderId")),
            EntityType::new("Item")
                .with_key("Id", ScalarType::Int32)
                .with_field(FieldDef::new("FolderId", ScalarType::Int32))
                .with_field(FieldDef::new("OwnerId", ScalarType::Int32)),
        ])
        .unwrap()
    }

    fn put(engine: &StorageEngine, root: &str, value: Value) {
        let key = RowKey::from_values([value.field("Id").unwrap()]).unwrap();
        engine.put(root, &key, &value).unwrap();
    }

    fn engine() -> StorageEngine {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let folder = |id: i32, owner: i32, parent: Option<i32>| {
            row(
                "Folder",
                &[
                    ("Id", Value::Int32(id)),
                    ("OwnerId", Value::Int32(owner)),
                    ("ParentId", parent.map(Value::Int32).unwrap_or(Value::Null)),
                ],
            )
        };
        let item = |id: i32, folder: i32, owner: i32| {
            row(
                "Item",
                &[
                    ("Id", Value::Int32(id)),
                    ("FolderId", Value::Int32(folder)),
                    ("OwnerId", Value::Int32(owner)),
                ],
            )
        };
        put(&engine, "Folder", folder(1, 2, None));
        put(&engine, "Folder", folder(2, 2, Some(1)));
        put(&engine, "Folder", folder(3, 3, Some(1)));
        put(&engine, "Folder", folder(4, 2, Some(2)));
        put(&engine, "Item", item(10, 2, 2));
        put(&engine, "Item", item(11, 2, 3));
        put(&engine, "Item", item(12, 4, 2));
        engine
    }

    fn owned_by(owner: i32) -> QueryOp {
        QueryOp::Where(Lambda::new(
            "x",
            Expr::var("x").member("OwnerId").eq(Expr::lit(owner)),
        ))
    }

    fn include(name: &str, entity: &str, then: bool) -> QueryOp {
        let lambda = IncludePath {
            hops: vec![IncludeHop {
                name: name.to_string(),
                guard: Some(Guard {
                    entity: entity.to_string(),
                    ops: vec![owned_by(2)],
                }),
            }],
            filters: Vec::new(),
        }
        .into_lambda("x")
        .unwrap();
        if then {
            QueryOp::ThenInclude(lambda)
        } else {
            QueryOp::Include(lambda)
        }
    }

    fn nested_plan() -> QueryPlan {
        QueryPlan::from_ops(
            "Folder",
            vec![
                owned_by(2),
                QueryOp::Where(Lambda::new(
                    "x",
                    Expr::var("x").member("ParentId").eq(Expr::lit(Value::Null)),
                )),
                include("Children", "Folder", false),
                include("Items", "Item", true),
            ],
        )
    }

    #[test]
    fn test_includes_are_filtered_per_level() {
        let catalog = catalog();
        let engine = engine();
        let result = QueryExecutor::new(&catalog, &engine)
            .execute(&nested_plan(), None)
            .unwrap();

        assert_eq!(result.total, None);
        assert_eq!(result.rows.len(), 1);
        let children = result.rows[0].field("Children").and_then(Value::as_list).unwrap();
        // folder 3 belongs to another owner
        assert_eq!(children.len(), 1);
        let items = children[0].field("Items").and_then(Value::as_list).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].field("Id"), Some(&Value::Int32(10)));
    }

    #[test]
    fn test_split_matches_per_row() {
        let catalog = catalog();
        let engine = engine();
        let plan = QueryPlan::from_ops(
            "Folder",
            vec![
                owned_by(2),
                include("Items", "Item", false),
                include("Parent", "Folder", false),
            ],
        );
        let per_row = QueryExecutor::new(&catalog, &engine)
            .execute(&plan, None)
            .unwrap();
        let split = QueryExecutor::new(&catalog, &engine)
            .with_strategy(IncludeStrategy::Split)
            .execute(&plan, None)
            .unwrap();
        assert_eq!(per_row, split);
        assert_eq!(per_row.rows.len(), 3);
        assert_eq!(per_row.rows[0].field("Parent"), Some(&Value::Null));
    }

    #[test]
    fn test_paging_reports_total() {
        let catalog = catalog();
        let engine = engine();
        let plan = QueryPlan::from_ops("Folder", vec![owned_by(2)]);
        let result = QueryExecutor::new(&catalog, &engine)
            .execute(&plan, Some(Page::new(1, 1)))
            .unwrap();
        assert_eq!(result.total, Some(3));
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].field("Id"), Some(&Value::Int32(2)));
    }

    #[test]
    fn test_projection_skips_includes() {
        let catalog = catalog();
        let engine = engine();
        let plan = QueryPlan::from_ops(
            "Folder",
            vec![
                owned_by(2),
                include("Items", "Item", false),
                QueryOp::Select(Lambda::new("x", Expr::var("x").member("Id"))),
            ],
        );
        let result = QueryExecutor::new(&catalog, &engine)
            .execute(&plan, None)
            .unwrap();
        assert_eq!(
            result.rows,
            vec![Value::Int32(1), Value::Int32(2), Value::Int32(4)]
        );
    }

    #[test]
    fn test_unsecured_include_is_rejected() {
        let catalog = catalog();
        let engine = engine();
        let plan = QueryPlan::new("Folder").include(Lambda::new("x", Expr::var("x").member("Items")));
        let err = QueryExecutor::new(&catalog, &engine)
            .execute(&plan, None)
            .unwrap_err();
        assert!(matches!(err, SecurityError::UnsupportedShape(_)));
    }

    #[test]
    fn test_execute_on_explicit_rows() {
        let catalog = catalog();
        let engine = engine();
        let candidate = row(
            "Folder",
            &[("Id", Value::Int32(99)), ("OwnerId", Value::Int32(3))],
        );
        let plan = QueryPlan::from_ops("Folder", vec![owned_by(2)]);
        let executor = QueryExecutor::new(&catalog, &engine);
        assert!(executor.execute_on(&plan, vec![candidate.clone()]).unwrap().rows.is_empty());
        let open = QueryPlan::new("Folder");
        assert_eq!(executor.execute_on(&open, vec![candidate]).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_cancelled_execution() {
        let catalog = catalog();
        let engine = engine();
        let token = CancellationToken::new();
        token.cancel();
        let err = QueryExecutor::new(&catalog, &engine)
            .with_cancellation(&token)
            .execute(&QueryPlan::new("Folder"), None)
            .unwrap_err();
        assert!(matches!(err, SecurityError::Cancelled));
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(IncludeStrategy::select(10), IncludeStrategy::PerRow);
        assert_eq!(IncludeStrategy::select(1000), IncludeStrategy::Split);
    }
}
