//! Per-type mutation hooks and the save scope that queues nested saves.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::tracker::{ChangeTracker, EntityHandle, TrackedEntity};
use crate::catalog::Catalog;
use crate::security::{FieldError, Operation, Principal, SecurityResult};

/// Callbacks around one entity's save.
///
/// Order per entity is fixed: `before_save`, `validate`, persist,
/// `after_save`. Every `before_save` and `validate` of a cycle completes
/// before anything is written; `after_save` runs only after commit.
pub trait MutationHooks: Send + Sync {
    /// Runs before validation. May change the entity (for example stamp an
    /// owner) or fail the save with `AccessDenied`.
    fn before_save(
        &self,
        _entity: &mut TrackedEntity,
        _operation: Operation,
        _ctx: &HookContext<'_>,
    ) -> SecurityResult<()> {
        Ok(())
    }

    /// Add field errors. Errors from all entities are reported together.
    fn validate(&self, _entity: &TrackedEntity, _operation: Operation, _errors: &mut Vec<FieldError>) {}

    /// Runs after the cycle committed.
    fn after_save(
        &self,
        _entity: &TrackedEntity,
        _operation: Operation,
        _ctx: &HookContext<'_>,
    ) -> SecurityResult<()> {
        Ok(())
    }
}

/// What a hook can see and do during a save.
pub struct HookContext<'a> {
    principal: &'a Principal,
    catalog: &'a Catalog,
    tracker: &'a ChangeTracker,
    scope: &'a SaveScope,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        principal: &'a Principal,
        catalog: &'a Catalog,
        tracker: &'a ChangeTracker,
        scope: &'a SaveScope,
    ) -> Self {
        Self {
            principal,
            catalog,
            tracker,
            scope,
        }
    }

    pub fn principal(&self) -> &Principal {
        self.principal
    }

    pub fn catalog(&self) -> &Catalog {
        self.catalog
    }

    /// Track another entity in the running save. It is collected and hooked
    /// before validation starts.
    pub fn track(&self, entity: TrackedEntity) -> EntityHandle {
        self.tracker.track(entity)
    }

    /// Save a separate unit of work once the running save has finished.
    pub fn save_later(&self, tracker: ChangeTracker) {
        self.scope.enqueue(tracker, self.principal.clone());
    }
}

/// Hooks per entity type. Hooks registered on an ancestor also run for its
/// subtypes, ancestors' first.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<Arc<dyn MutationHooks>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entity: impl Into<String>, hooks: Arc<dyn MutationHooks>) -> Self {
        self.hooks.entry(entity.into()).or_default().push(hooks);
        self
    }

    /// Hooks that apply to `entity`.
    pub fn for_entity(&self, catalog: &Catalog, entity: &str) -> Vec<Arc<dyn MutationHooks>> {
        catalog
            .lineage(entity)
            .into_iter()
            .rev()
            .filter_map(|ancestor| self.hooks.get(&ancestor.name))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Saves requested by hooks during one save cycle.
///
/// Each cycle owns its scope. Queued saves run only after that cycle has
/// committed; a rolled-back cycle drops its scope and everything in it.
#[derive(Default)]
pub struct SaveScope {
    queue: Mutex<VecDeque<(ChangeTracker, Principal)>>,
}

impl SaveScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, tracker: ChangeTracker, principal: Principal) {
        self.queue.lock().push_back((tracker, principal));
    }

    /// Take every queued save, leaving the scope empty.
    pub(crate) fn take(&self) -> VecDeque<(ChangeTracker, Principal)> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Number of saves waiting to be drained.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityType, ScalarType};

    struct Named(&'static str);

    impl MutationHooks for Named {
        fn validate(&self, _entity: &TrackedEntity, _op: Operation, errors: &mut Vec<FieldError>) {
            errors.push(FieldError::new(self.0, "hooked"));
        }
    }

    #[test]
    fn test_ancestor_hooks_run_first() {
        let catalog = Catalog::new(vec![
            EntityType::new("Folder").with_key("Id", ScalarType::Int32),
            EntityType::new("SharedFolder").with_parent("Folder"),
        ])
        .unwrap();
        let registry = HookRegistry::new()
            .register("SharedFolder", Arc::new(Named("shared")))
            .register("Folder", Arc::new(Named("folder")));

        let entity = TrackedEntity::added("SharedFolder", Default::default());
        let mut errors = Vec::new();
        for hook in registry.for_entity(&catalog, "SharedFolder") {
            hook.validate(&entity, Operation::Insert, &mut errors);
        }
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["folder", "shared"]);
        assert_eq!(registry.for_entity(&catalog, "Folder").len(), 1);
    }

    #[test]
    fn test_scope_take_empties_queue() {
        let scope = SaveScope::new();
        scope.enqueue(ChangeTracker::new(), Principal::new(1));
        scope.enqueue(ChangeTracker::new(), Principal::new(2));
        assert_eq!(scope.queued(), 2);

        let taken = scope.take();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].1, Principal::new(1));
        assert_eq!(scope.queued(), 0);
    }
}
