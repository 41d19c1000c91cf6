//! Post-write verification.
//!
//! After a cycle's writes are staged, every inserted or updated row must
//! still be visible through its type's select rule, and every reference
//! whose foreign key changed must point at a row visible through the
//! target's select rule. Checks are batched into one query per type.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};
use warden_proto::{Expr, Lambda, QueryPlan, Value};

use super::tracker::PendingChange;
use crate::catalog::{Catalog, NavigationKind};
use crate::query::{FilterInjector, QueryExecutor};
use crate::security::{Operation, Principal, RuleRegistry, SecurityError, SecurityResult};
use crate::storage::{RowKey, RowSource};

/// What a verification task checks.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationKind {
    /// The written row must come back unchanged.
    Recheck { operation: Operation, row: Value },
    /// The referenced row must be visible.
    Reference { owner: String, navigation: String },
}

/// One check against the select rule of `entity`.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationTask {
    pub entity: String,
    /// Key values in the order of the type's key fields.
    pub key: Vec<Value>,
    pub kind: VerificationKind,
}

impl VerificationTask {
    /// Tasks for a cycle's non-delete changes, read after link resolution.
    pub fn plan(catalog: &Catalog, pending: &[PendingChange]) -> Vec<VerificationTask> {
        let mut tasks = Vec::new();
        for change in pending {
            if change.operation == Operation::Delete {
                continue;
            }
            let entity = change.handle.read();
            let row = entity.to_row();
            let key: Vec<Value> = catalog
                .keys(entity.entity())
                .iter()
                .map(|k| entity.get(k).cloned().unwrap_or(Value::Null))
                .collect();
            tasks.push(VerificationTask {
                entity: entity.entity().to_string(),
                key,
                kind: VerificationKind::Recheck {
                    operation: change.operation,
                    row,
                },
            });

            for navigation in catalog.navigations(entity.entity()) {
                let NavigationKind::Reference { foreign_key } = &navigation.kind else {
                    continue;
                };
                let Some(value) = entity.get(foreign_key).filter(|v| !v.is_null()) else {
                    continue;
                };
                let changed = match entity.original() {
                    None => true,
                    Some(original) => original.get(foreign_key) != Some(value),
                };
                if changed {
                    tasks.push(VerificationTask {
                        entity: navigation.target.clone(),
                        key: vec![value.clone()],
                        kind: VerificationKind::Reference {
                            owner: entity.entity().to_string(),
                            navigation: navigation.name.clone(),
                        },
                    });
                }
            }
        }
        tasks
    }
}

/// Runs verification tasks against a transaction view.
pub struct Verifier<'a> {
    registry: &'a RuleRegistry,
    principal: &'a Principal,
    source: &'a dyn RowSource,
}

impl<'a> Verifier<'a> {
    pub fn new(registry: &'a RuleRegistry, principal: &'a Principal, source: &'a dyn RowSource) -> Self {
        Self {
            registry,
            principal,
            source,
        }
    }

    /// Run all tasks; the first failing one is reported.
    pub fn verify(&self, tasks: &[VerificationTask]) -> SecurityResult<()> {
        let mut by_entity: BTreeMap<&str, Vec<&VerificationTask>> = BTreeMap::new();
        for task in tasks {
            by_entity.entry(task.entity.as_str()).or_default().push(task);
        }

        for (entity, tasks) in by_entity {
            let visible = self.visible_rows(entity, &tasks)?;
            debug!(entity, checks = tasks.len(), visible = visible.len(), "verified batch");
            for task in tasks {
                let found = RowKey::from_values(task.key.iter())
                    .and_then(|key| visible.get(&key.encode()));
                if let Err(err) = check(task, found) {
                    warn!(entity, error = %err, "verification failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Rows of `entity` among the tasks' keys that the select rule lets
    /// through, by encoded key.
    fn visible_rows(
        &self,
        entity: &str,
        tasks: &[&VerificationTask],
    ) -> SecurityResult<HashMap<Vec<u8>, Value>> {
        let catalog = self.registry.catalog();
        let keys = catalog.keys(entity);
        let matches = tasks.iter().map(|task| {
            Expr::all(
                keys.iter()
                    .zip(&task.key)
                    .map(|(name, value)| Expr::var("x").member(name.as_str()).eq(Expr::lit(value.clone()))),
            )
        });
        let plan = QueryPlan::new(entity).filter(Lambda::new("x", Expr::any(matches)));
        let secured = FilterInjector::new(self.registry, self.principal).secure(&plan)?;
        let result = QueryExecutor::new(catalog, self.source).execute(&secured.plan, None)?;

        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| catalog.key_of(entity, &row).map(|key| (key.encode(), row)))
            .collect())
    }
}

fn check(task: &VerificationTask, found: Option<&Value>) -> SecurityResult<()> {
    match (&task.kind, found) {
        (VerificationKind::Recheck { row, .. }, Some(visible)) if visible == row => Ok(()),
        (VerificationKind::Recheck { operation, .. }, Some(_)) => Err(SecurityError::access_denied(
            &task.entity,
            *operation,
            "row changed before verification",
        )),
        (VerificationKind::Recheck { operation, .. }, None) => Err(SecurityError::access_denied(
            &task.entity,
            *operation,
            "row is not visible after save",
        )),
        (VerificationKind::Reference { .. }, Some(_)) => Ok(()),
        (VerificationKind::Reference { owner, navigation }, None) => {
            Err(SecurityError::access_denied(
                &task.entity,
                Operation::Select,
                format!("{}.{} references a row that is not visible", owner, navigation),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityType, FieldDef, NavigationDef, ScalarType};
    use crate::mutation::tracker::{ChangeTracker, TrackedEntity};
    use crate::security::{PolicyRule, RuleSet};
    use crate::storage::engine::tests::row;
    use crate::storage::{StorageConfig, StorageEngine};
    use std::sync::Arc;

    fn registry() -> RuleRegistry {
        let catalog = Arc::new(
            Catalog::new(vec![
                EntityType::new("Folder")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("OwnerId", ScalarType::Int32)),
                EntityType::new("Item")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("OwnerId", ScalarType::Int32))
                    .with_field(FieldDef::new("FolderId", ScalarType::Int32))
                    .with_navigation(NavigationDef::reference("Folder", "Folder", "FolderId")),
            ])
            .unwrap(),
        );
        let owner = |entity: &str| {
            PolicyRule::from("x => x.OwnerId == $principal".to_string())
                .compile(&catalog, entity)
                .unwrap()
        };
        RuleRegistry::builder(catalog.clone())
            .register("Folder", RuleSet::new().all(owner("Folder")))
            .register("Item", RuleSet::new().all(owner("Item")))
            .build()
            .unwrap()
    }

    fn store(engine: &StorageEngine, entity: &str, id: i32, owner: i32, folder: Option<i32>) -> Value {
        let mut fields = vec![("Id", Value::Int32(id)), ("OwnerId", Value::Int32(owner))];
        if let Some(folder) = folder {
            fields.push(("FolderId", Value::Int32(folder)));
        }
        let value = row(entity, &fields);
        engine
            .put(entity, &RowKey::from_values([&Value::Int32(id)]).unwrap(), &value)
            .unwrap();
        value
    }

    #[test]
    fn test_plan_includes_changed_references_only() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let stored = store(&engine, "Item", 1, 2, Some(5));
        let tracker = ChangeTracker::new();
        let unchanged_fk = tracker.attach("Item", &stored);
        unchanged_fk.write().set("OwnerId", 3);
        let moved = tracker.attach("Item", &stored);
        moved.write().set("FolderId", 6);

        let tasks = VerificationTask::plan(registry.catalog(), &tracker.pending());
        let references: Vec<_> = tasks
            .iter()
            .filter(|t| matches!(t.kind, VerificationKind::Reference { .. }))
            .collect();
        assert_eq!(tasks.len(), 3);
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].key, vec![Value::Int32(6)]);
    }

    #[test]
    fn test_visible_rows_pass() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        store(&engine, "Folder", 5, 2, None);
        let item = store(&engine, "Item", 1, 2, Some(5));

        let tracker = ChangeTracker::new();
        tracker.track(TrackedEntity::added(
            "Item",
            item.as_object()
                .unwrap()
                .iter()
                .filter(|(k, _)| !k.starts_with('$'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ));
        let tasks = VerificationTask::plan(registry.catalog(), &tracker.pending());
        let principal = Principal::new(2);
        Verifier::new(&registry, &principal, &engine).verify(&tasks).unwrap();
    }

    #[test]
    fn test_reference_to_hidden_row_is_denied() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        store(&engine, "Folder", 5, 3, None);
        store(&engine, "Item", 1, 2, Some(5));

        let task = VerificationTask {
            entity: "Folder".to_string(),
            key: vec![Value::Int32(5)],
            kind: VerificationKind::Reference {
                owner: "Item".to_string(),
                navigation: "Folder".to_string(),
            },
        };
        let principal = Principal::new(2);
        let err = Verifier::new(&registry, &principal, &engine)
            .verify(&[task])
            .unwrap_err();
        match err {
            SecurityError::AccessDenied { entity, operation, .. } => {
                assert_eq!(entity, "Folder");
                assert_eq!(operation, Operation::Select);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invisible_written_row_is_denied() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let item = store(&engine, "Item", 1, 3, None);
        let task = VerificationTask {
            entity: "Item".to_string(),
            key: vec![Value::Int32(1)],
            kind: VerificationKind::Recheck {
                operation: Operation::Insert,
                row: item,
            },
        };
        let principal = Principal::new(2);
        let err = Verifier::new(&registry, &principal, &engine)
            .verify(&[task])
            .unwrap_err();
        assert!(matches!(
            err,
            SecurityError::AccessDenied { operation: Operation::Insert, .. }
        ));
    }
}
