//! Change tracking for entity graphs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use warden_proto::{Value, TYPE_TAG};

use crate::catalog::{Catalog, NavigationDef, NavigationKind};
use crate::security::Operation;
use crate::storage::RowKey;

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// New row; inserted on save.
    Added,
    /// Loaded row with changed fields; updated on save.
    Modified,
    /// Loaded row marked for removal.
    Deleted,
    /// Loaded row without changes.
    Unchanged,
    /// Deleted and committed; no longer saved.
    Detached,
}

impl EntityState {
    /// The write this state produces, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            EntityState::Added => Some(Operation::Insert),
            EntityState::Modified => Some(Operation::Update),
            EntityState::Deleted => Some(Operation::Delete),
            EntityState::Unchanged | EntityState::Detached => None,
        }
    }
}

/// An entity instance and its tracked state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    entity: String,
    state: EntityState,
    values: BTreeMap<String, Value>,
    original: Option<BTreeMap<String, Value>>,
}

impl TrackedEntity {
    /// A new row of runtime type `entity`.
    pub fn added(entity: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            entity: entity.into(),
            state: EntityState::Added,
            values,
            original: None,
        }
    }

    /// A stored row. The runtime type is read from the row's `$type` tag,
    /// falling back to `entity`.
    pub fn loaded(entity: &str, row: &Value) -> Self {
        let mut values = row.as_object().cloned().unwrap_or_default();
        let runtime = match values.remove(TYPE_TAG) {
            Some(Value::String(name)) => name,
            _ => entity.to_string(),
        };
        Self {
            entity: runtime,
            state: EntityState::Unchanged,
            original: Some(values.clone()),
            values,
        }
    }

    /// Runtime type name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Set a field. An unchanged row becomes modified when the value differs.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if self.values.get(&name) == Some(&value) {
            return;
        }
        self.values.insert(name, value);
        if self.state == EntityState::Unchanged {
            self.state = EntityState::Modified;
        }
    }

    /// Field values, without the type tag.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.values
    }

    /// Values as they were loaded, for rows that exist in storage.
    pub fn original(&self) -> Option<&BTreeMap<String, Value>> {
        self.original.as_ref()
    }

    /// Fields whose value differs from the loaded row. Every field of a new
    /// row counts as changed.
    pub fn changed_fields(&self) -> Vec<&str> {
        match &self.original {
            None => self.values.keys().map(String::as_str).collect(),
            Some(original) => self
                .values
                .iter()
                .filter(|(name, value)| original.get(*name) != Some(*value))
                .map(|(name, _)| name.as_str())
                .collect(),
        }
    }

    /// The row as stored: field values plus the `$type` tag.
    pub fn to_row(&self) -> Value {
        let mut map = self.values.clone();
        map.insert(TYPE_TAG.to_string(), Value::from(self.entity.as_str()));
        Value::Object(map)
    }

    pub fn key(&self, catalog: &Catalog) -> Option<RowKey> {
        catalog.key_of(&self.entity, &self.to_row())
    }

    /// Record a successful save.
    pub(crate) fn accept(&mut self) {
        match self.state {
            EntityState::Deleted => {
                self.state = EntityState::Detached;
                self.original = None;
            }
            EntityState::Added | EntityState::Modified => {
                self.state = EntityState::Unchanged;
                self.original = Some(self.values.clone());
            }
            EntityState::Unchanged | EntityState::Detached => {}
        }
    }
}

/// Shared handle to a tracked entity. A payload that references one object
/// twice yields two clones of the same handle.
pub type EntityHandle = Arc<RwLock<TrackedEntity>>;

/// A relationship whose foreign key is filled in at save time, once both
/// sides have keys.
#[derive(Clone)]
pub struct Link {
    pub owner: EntityHandle,
    pub navigation: NavigationDef,
    pub target: EntityHandle,
}

impl Link {
    /// The entity that receives the foreign key and the field name.
    pub fn dependent(&self) -> (&EntityHandle, &str) {
        match &self.navigation.kind {
            NavigationKind::Reference { foreign_key } => (&self.owner, foreign_key),
            NavigationKind::Collection { inverse_key } => (&self.target, inverse_key),
        }
    }

    /// The entity whose key is copied.
    pub fn principal(&self) -> &EntityHandle {
        match &self.navigation.kind {
            NavigationKind::Reference { .. } => &self.target,
            NavigationKind::Collection { .. } => &self.owner,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("owner", &self.owner.read().entity())
            .field("navigation", &self.navigation.name)
            .field("target", &self.target.read().entity())
            .finish()
    }
}

/// One write captured at the start of a save cycle.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub operation: Operation,
    pub entity: String,
    pub handle: EntityHandle,
}

/// Tracks the entities of one unit of work.
///
/// Tracking takes `&self` so hooks can add entities while a save is
/// collecting changes.
#[derive(Default)]
pub struct ChangeTracker {
    entries: Mutex<Vec<EntityHandle>>,
    links: Mutex<Vec<Link>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new row.
    pub fn add(&self, entity: impl Into<String>, values: BTreeMap<String, Value>) -> EntityHandle {
        self.track(TrackedEntity::added(entity, values))
    }

    /// Track a stored row as unchanged.
    pub fn attach(&self, entity: &str, row: &Value) -> EntityHandle {
        self.track(TrackedEntity::loaded(entity, row))
    }

    pub fn track(&self, entity: TrackedEntity) -> EntityHandle {
        let handle = Arc::new(RwLock::new(entity));
        self.entries.lock().push(handle.clone());
        handle
    }

    /// Track an existing handle; tracking the same handle twice is a no-op.
    pub fn track_handle(&self, handle: &EntityHandle) {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|h| Arc::ptr_eq(h, handle)) {
            entries.push(handle.clone());
        }
    }

    /// Record that `owner.navigation` points at `target`.
    pub fn link(&self, owner: &EntityHandle, navigation: NavigationDef, target: &EntityHandle) {
        self.links.lock().push(Link {
            owner: owner.clone(),
            navigation,
            target: target.clone(),
        });
    }

    pub fn entries(&self) -> Vec<EntityHandle> {
        self.entries.lock().clone()
    }

    pub fn links(&self) -> Vec<Link> {
        self.links.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fields of `handle` that a link will fill in at save time.
    pub fn linked_fields(&self, handle: &EntityHandle) -> Vec<String> {
        self.links
            .lock()
            .iter()
            .filter_map(|link| {
                let (dependent, field) = link.dependent();
                Arc::ptr_eq(dependent, handle).then(|| field.to_string())
            })
            .collect()
    }

    /// All writes the tracker would currently produce, in tracking order.
    pub fn pending(&self) -> Vec<PendingChange> {
        self.entries()
            .into_iter()
            .filter_map(|handle| {
                let (operation, entity) = {
                    let entity = handle.read();
                    (entity.state().operation()?, entity.entity().to_string())
                };
                Some(PendingChange {
                    operation,
                    entity,
                    handle,
                })
            })
            .collect()
    }
}
