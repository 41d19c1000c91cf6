//! The save cycle.
//!
//! Collecting -> Validating -> Persisting -> Verifying -> Committed, with any
//! failure after Collecting rolling the whole cycle back. Writes are staged
//! in one storage transaction; rules and verification read through it, and
//! nothing is visible outside until commit.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};
use warden_proto::Value;

use super::hooks::{HookContext, HookRegistry, SaveScope};
use super::tracker::{ChangeTracker, EntityHandle, EntityState, PendingChange, TrackedEntity};
use super::validate::FieldValidator;
use super::verify::{VerificationTask, Verifier};
use crate::catalog::{Catalog, ScalarType};
use crate::error::Error;
use crate::query::QueryExecutor;
use crate::security::{Operation, Principal, RuleRegistry, SecurityError, SecurityResult};
use crate::storage::{RowKey, RowSource, StorageEngine, Transaction};

/// Counts of one save, including saves queued by hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Queued saves that ran after this one.
    pub drained: usize,
    /// Failures after commit: `after_save` hook errors and queued saves that
    /// rolled back. Committed writes stay in place.
    pub failures: Vec<String>,
}

impl SaveOutcome {
    fn merge(&mut self, other: SaveOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.drained += other.drained;
        self.failures.extend(other.failures);
    }
}

/// Tracked values before the cycle touched them.
struct Snapshot(Vec<(EntityHandle, TrackedEntity)>);

impl Snapshot {
    fn take(tracker: &ChangeTracker) -> Self {
        Snapshot(
            tracker
                .entries()
                .into_iter()
                .map(|handle| {
                    let saved = handle.read().clone();
                    (handle, saved)
                })
                .collect(),
        )
    }

    fn restore(self) {
        for (handle, saved) in self.0 {
            *handle.write() = saved;
        }
    }
}

/// Runs save cycles against a storage engine.
pub struct SavePipeline {
    registry: Arc<RuleRegistry>,
    engine: Arc<StorageEngine>,
    hooks: HookRegistry,
}

impl SavePipeline {
    pub fn new(registry: Arc<RuleRegistry>, engine: Arc<StorageEngine>) -> Self {
        Self {
            registry,
            engine,
            hooks: HookRegistry::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Save every pending change of `tracker` as `principal`.
    ///
    /// Saves queued by hooks through [`HookContext::save_later`] run after
    /// this save commits, each in its own cycle. If this save rolls back,
    /// its queued saves are discarded. A queued save that fails is rolled
    /// back on its own and reported in [`SaveOutcome::failures`].
    pub fn save(&self, tracker: ChangeTracker, principal: &Principal) -> SecurityResult<SaveOutcome> {
        let (mut outcome, mut queue) = self.cycle(&tracker, principal)?;
        while let Some((queued, queued_principal)) = queue.pop_front() {
            debug!(remaining = queue.len(), "draining queued save");
            match self.cycle(&queued, &queued_principal) {
                Ok((drained, more)) => {
                    outcome.merge(drained);
                    outcome.drained += 1;
                    queue.extend(more);
                }
                Err(err) => {
                    warn!(error = %err, "queued save rolled back");
                    outcome.failures.push(format!("queued save: {}", err));
                }
            }
        }
        Ok(outcome)
    }

    /// One save cycle. Returns the saves its hooks queued, which are only
    /// handed out on commit.
    fn cycle(
        &self,
        tracker: &ChangeTracker,
        principal: &Principal,
    ) -> SecurityResult<(SaveOutcome, VecDeque<(ChangeTracker, Principal)>)> {
        let scope = SaveScope::new();
        let snapshot = Snapshot::take(tracker);
        let mut tx = self.engine.transaction();
        let pending = match self.run(tracker, principal, &scope, &mut tx) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, discarded = scope.queued(), "save rolled back");
                tx.rollback();
                snapshot.restore();
                return Err(err);
            }
        };
        if let Err(err) = tx.commit() {
            warn!(error = %err, discarded = scope.queued(), "commit failed");
            snapshot.restore();
            return Err(err.into());
        }
        debug!(state = "committed", changes = pending.len(), "save cycle");
        let outcome = self.finish(tracker, principal, &pending, &scope);
        Ok((outcome, scope.take()))
    }

    fn run(
        &self,
        tracker: &ChangeTracker,
        principal: &Principal,
        scope: &SaveScope,
        tx: &mut Transaction<'_>,
    ) -> SecurityResult<Vec<PendingChange>> {
        let catalog = self.registry.catalog().as_ref();
        let ctx = HookContext::new(principal, catalog, tracker, scope);

        debug!(state = "collecting", tracked = tracker.len(), "save cycle");
        let pending = self.collect(tracker, &ctx)?;
        if pending.is_empty() {
            return Ok(pending);
        }

        debug!(state = "validating", changes = pending.len(), "save cycle");
        self.validate(tracker, &pending)?;
        for change in &pending {
            self.authorize(change, principal, &*tx)?;
        }

        debug!(state = "persisting", changes = pending.len(), "save cycle");
        self.persist(tracker, &pending, tx)?;

        debug!(state = "verifying", changes = pending.len(), "save cycle");
        let tasks = VerificationTask::plan(catalog, &pending);
        Verifier::new(&self.registry, principal, &*tx).verify(&tasks)?;
        Ok(pending)
    }

    /// Pending changes with `before_save` run once per entity. Hooks may
    /// track more entities, so collection repeats until nothing new appears.
    fn collect(&self, tracker: &ChangeTracker, ctx: &HookContext<'_>) -> SecurityResult<Vec<PendingChange>> {
        let catalog = self.registry.catalog();
        let mut hooked: HashSet<*const ()> = HashSet::new();
        loop {
            let pending = tracker.pending();
            let fresh: Vec<&PendingChange> = pending
                .iter()
                .filter(|change| hooked.insert(Arc::as_ptr(&change.handle) as *const ()))
                .collect();
            if fresh.is_empty() {
                // Hooks may have changed states; collect once more.
                return Ok(tracker.pending());
            }
            for change in fresh {
                for hook in self.hooks.for_entity(catalog, &change.entity) {
                    let mut entity = change.handle.write();
                    hook.before_save(&mut entity, change.operation, ctx)?;
                }
            }
        }
    }

    fn validate(&self, tracker: &ChangeTracker, pending: &[PendingChange]) -> SecurityResult<()> {
        let catalog = self.registry.catalog();
        let validator = FieldValidator::new(catalog, &self.registry);
        let mut errors = Vec::new();
        for change in pending {
            let linked = tracker.linked_fields(&change.handle);
            let mut entity = change.handle.write();
            validator.validate(change.operation, &mut entity, &linked, &mut errors);
            for hook in self.hooks.for_entity(catalog, &change.entity) {
                hook.validate(&entity, change.operation, &mut errors);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            warn!(errors = errors.len(), "save failed validation");
            Err(SecurityError::ValidationFailed(errors))
        }
    }

    /// Apply the change's operation rule. Inserts are checked against the
    /// new row itself, updates and deletes against the stored row.
    fn authorize(
        &self,
        change: &PendingChange,
        principal: &Principal,
        source: &dyn RowSource,
    ) -> SecurityResult<()> {
        let catalog = self.registry.catalog();
        let rule = self.registry.resolve(&change.entity, change.operation)?;
        let plan = rule
            .base_plan(&change.entity, principal)?
            .bind_principal(principal.value());

        let candidate = match change.operation {
            Operation::Insert => change.handle.read().to_row(),
            _ => self.stored_row(catalog, &change.handle, source)?,
        };
        let visible = QueryExecutor::new(catalog, source).execute_on(&plan, vec![candidate])?;
        if visible.rows.is_empty() {
            warn!(entity = %change.entity, operation = %change.operation, rule = rule.name(), "write denied");
            return Err(SecurityError::access_denied(
                &change.entity,
                change.operation,
                format!("rejected by rule '{}'", rule.name()),
            ));
        }
        Ok(())
    }

    fn stored_row(
        &self,
        catalog: &Catalog,
        handle: &EntityHandle,
        source: &dyn RowSource,
    ) -> SecurityResult<Value> {
        let entity = handle.read();
        let (root, key) = storage_location(catalog, &entity)?;
        source.get(root, &key)?.ok_or_else(|| {
            SecurityError::from(Error::NotFound {
                entity: entity.entity().to_string(),
                key: format!("{:?}", key.parts()),
            })
        })
    }

    /// Assign generated keys, resolve links, apply column defaults and stage
    /// the writes.
    fn persist(
        &self,
        tracker: &ChangeTracker,
        pending: &[PendingChange],
        tx: &mut Transaction<'_>,
    ) -> SecurityResult<()> {
        let catalog = self.registry.catalog();

        for change in pending.iter().filter(|c| c.operation == Operation::Insert) {
            self.assign_key(catalog, &change.handle)?;
        }

        for link in tracker.links() {
            let (dependent, field) = link.dependent();
            let key = {
                let principal = link.principal().read();
                catalog
                    .single_key(principal.entity())
                    .and_then(|k| principal.get(&k.name).cloned())
            };
            let mut dependent = dependent.write();
            if !matches!(dependent.state(), EntityState::Added | EntityState::Modified) {
                continue;
            }
            if let Some(key) = key {
                dependent.values_mut().insert(field.to_string(), key);
            }
        }

        for change in pending {
            let mut entity = change.handle.write();
            if change.operation == Operation::Insert {
                for field in catalog.fields(entity.entity()) {
                    if entity.get(&field.name).is_none() {
                        let value = field.default.clone().unwrap_or(Value::Null);
                        entity.values_mut().insert(field.name.clone(), value);
                    }
                }
            }
            let (root, key) = storage_location(catalog, &entity)?;
            match change.operation {
                Operation::Delete => {
                    tx.delete(root, key);
                }
                _ => {
                    tx.put(root, key, entity.to_row());
                }
            }
        }
        Ok(())
    }

    fn assign_key(&self, catalog: &Catalog, handle: &EntityHandle) -> SecurityResult<()> {
        let mut entity = handle.write();
        let Some(key) = catalog.single_key(entity.entity()) else {
            return Ok(());
        };
        if entity.get(&key.name).is_some_and(|v| !v.is_null()) {
            return Ok(());
        }
        let id = self.engine.generate_id()?;
        let value = match key.scalar_type {
            ScalarType::Int32 => i32::try_from(id)
                .map(Value::Int32)
                .map_err(|_| Error::InvalidData(format!("generated id {} overflows {}", id, key.name)))?,
            ScalarType::Int64 => Value::Int64(id),
            _ => return Ok(()),
        };
        let name = key.name.clone();
        entity.values_mut().insert(name, value);
        Ok(())
    }

    /// Accept committed changes and run `after_save` hooks. The cycle has
    /// already committed, so hook errors are recorded, not returned.
    fn finish(
        &self,
        tracker: &ChangeTracker,
        principal: &Principal,
        pending: &[PendingChange],
        scope: &SaveScope,
    ) -> SaveOutcome {
        let catalog = self.registry.catalog().as_ref();
        let ctx = HookContext::new(principal, catalog, tracker, scope);
        let mut outcome = SaveOutcome::default();
        for change in pending {
            change.handle.write().accept();
            match change.operation {
                Operation::Insert => outcome.inserted += 1,
                Operation::Update => outcome.updated += 1,
                Operation::Delete => outcome.deleted += 1,
                Operation::Select => {}
            }
        }
        for change in pending {
            let entity = change.handle.read();
            for hook in self.hooks.for_entity(catalog, &change.entity) {
                if let Err(err) = hook.after_save(&entity, change.operation, &ctx) {
                    warn!(entity = %change.entity, error = %err, "after_save hook failed");
                    outcome
                        .failures
                        .push(format!("after_save on '{}': {}", change.entity, err));
                }
            }
        }
        outcome
    }
}

/// Hierarchy root and key of a tracked entity.
fn storage_location<'c>(catalog: &'c Catalog, entity: &TrackedEntity) -> Result<(&'c str, RowKey), Error> {
    let root = catalog
        .root_of(entity.entity())
        .ok_or_else(|| Error::UnknownEntity(entity.entity().to_string()))?;
    let key = entity
        .key(catalog)
        .ok_or_else(|| Error::InvalidData(format!("{} row has no key", entity.entity())))?;
    Ok((root, key))
}
