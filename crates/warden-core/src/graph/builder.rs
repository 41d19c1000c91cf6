//! Build tracked entity graphs from nested JSON payloads.
//!
//! Payload conventions:
//!
//! - `"$type"` names the runtime type when it is a subtype of the expected one
//! - `"$id"` registers the object in a request-scoped reference table
//! - `{"$ref": id}` stands for the object registered under `id`
//! - `"$deleted": true` marks the object for removal
//!
//! Objects whose key fields are all present are loaded from storage and
//! tracked as modified; other objects are new.

use std::collections::HashMap;

use serde_json::Map;
use tracing::debug;
use warden_proto::{Value, TYPE_TAG};

use crate::catalog::{Member, NavigationDef, NavigationKind};
use crate::error::Error;
use crate::mutation::{ChangeTracker, EntityHandle, EntityState, TrackedEntity};
use crate::security::{RuleRegistry, SecurityError, SecurityResult};
use crate::storage::{RowKey, RowSource};

/// Marker for a request-scoped object id.
pub const ID_TAG: &str = "$id";
/// Marker for a reference to an object registered with [`ID_TAG`].
pub const REF_TAG: &str = "$ref";
/// Marker for deletion.
pub const DELETED_TAG: &str = "$deleted";

/// Builds entities from one payload into a change tracker.
pub struct GraphBuilder<'a> {
    registry: &'a RuleRegistry,
    source: &'a dyn RowSource,
    tracker: &'a ChangeTracker,
    refs: HashMap<String, EntityHandle>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a RuleRegistry, source: &'a dyn RowSource, tracker: &'a ChangeTracker) -> Self {
        Self {
            registry,
            source,
            tracker,
            refs: HashMap::new(),
        }
    }

    /// Build one object, or every object of an array, as `entity`.
    pub fn build(&mut self, entity: &str, payload: &serde_json::Value) -> SecurityResult<Vec<EntityHandle>> {
        match payload {
            serde_json::Value::Array(items) => items.iter().map(|item| self.build_one(entity, item)).collect(),
            other => Ok(vec![self.build_one(entity, other)?]),
        }
    }

    /// Build a single object.
    pub fn build_one(&mut self, entity: &str, payload: &serde_json::Value) -> SecurityResult<EntityHandle> {
        let serde_json::Value::Object(object) = payload else {
            return Err(invalid(format!("expected an object for '{}'", entity)));
        };
        if let Some(reference) = object.get(REF_TAG) {
            let id = ref_id(reference);
            return self
                .refs
                .get(&id)
                .cloned()
                .ok_or_else(|| invalid(format!("unknown {} '{}'", REF_TAG, id)));
        }

        let catalog = self.registry.catalog().clone();
        let runtime = match object.get(TYPE_TAG).and_then(|t| t.as_str()) {
            Some(name) if catalog.is_subtype(name, entity) => name.to_string(),
            Some(name) => {
                return Err(invalid(format!("'{}' is not a subtype of '{}'", name, entity)));
            }
            None => entity.to_string(),
        };
        catalog.get(&runtime)?;

        let flags = self.registry.property_flags(&runtime);
        let mut scalars = Vec::new();
        let mut navigations: Vec<(NavigationDef, &serde_json::Value)> = Vec::new();
        for (name, value) in object {
            if name.starts_with('$') || flags.is_hidden(name) {
                continue;
            }
            match catalog.member(&runtime, name) {
                Some(Member::Navigation(navigation)) => navigations.push((navigation.clone(), value)),
                // unknown names are kept so validation reports them
                Some(Member::Field(_)) | None => scalars.push((name.clone(), Value::from_json(value))),
            }
        }

        let deleted = object.get(DELETED_TAG).and_then(|d| d.as_bool()).unwrap_or(false);
        let handle = match self.load(&runtime, object)? {
            Some(mut existing) => {
                let keys = catalog.keys(&runtime);
                for (name, value) in scalars {
                    if keys.contains(&name) || flags.is_read_only(&name) {
                        continue;
                    }
                    existing.set(name, value);
                }
                if deleted {
                    existing.set_state(EntityState::Deleted);
                }
                self.tracker.track(existing)
            }
            None if deleted => {
                return Err(invalid(format!("cannot delete a '{}' that does not exist", runtime)));
            }
            None => self.tracker.add(runtime.clone(), scalars.into_iter().collect()),
        };

        if let Some(id) = object.get(ID_TAG) {
            self.refs.insert(ref_id(id), handle.clone());
        }

        for (navigation, value) in navigations {
            self.build_navigation(&handle, navigation, value)?;
        }
        debug!(entity = %runtime, state = ?handle.read().state(), "built entity");
        Ok(handle)
    }

    /// `BuildOrLoad`: the stored row when every key field is supplied and
    /// the row exists.
    fn load(&self, entity: &str, object: &Map<String, serde_json::Value>) -> SecurityResult<Option<TrackedEntity>> {
        let catalog = self.registry.catalog();
        let keys = catalog.keys(entity);
        let values: Option<Vec<Value>> = keys
            .iter()
            .map(|k| object.get(k).map(Value::from_json).filter(|v| !v.is_null()))
            .collect();
        let Some(key) = values.as_ref().and_then(|v| RowKey::from_values(v.iter())) else {
            return Ok(None);
        };
        let root = catalog
            .root_of(entity)
            .ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        Ok(self
            .source
            .get(root, &key)?
            .map(|row| TrackedEntity::loaded(entity, &row)))
    }

    fn build_navigation(
        &mut self,
        owner: &EntityHandle,
        navigation: NavigationDef,
        value: &serde_json::Value,
    ) -> SecurityResult<()> {
        match value {
            serde_json::Value::Null if !navigation.is_collection() => {
                if let NavigationKind::Reference { foreign_key } = &navigation.kind {
                    owner.write().set(foreign_key.clone(), Value::Null);
                }
                Ok(())
            }
            serde_json::Value::Array(items) if navigation.is_collection() => {
                for item in items {
                    let child = self.build_one(&navigation.target, item)?;
                    self.tracker.link(owner, navigation.clone(), &child);
                }
                Ok(())
            }
            serde_json::Value::Object(_) if !navigation.is_collection() => {
                let target = self.build_one(&navigation.target, value)?;
                self.tracker.link(owner, navigation, &target);
                Ok(())
            }
            _ => Err(invalid(format!(
                "unexpected value for navigation '{}'",
                navigation.name
            ))),
        }
    }
}

fn ref_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid(message: String) -> SecurityError {
    SecurityError::Storage(Error::InvalidData(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, EntityType, FieldDef, ScalarType};
    use crate::security::{IgnoreCondition, RuleSet, SecurityRule};
    use crate::storage::engine::tests::row;
    use crate::storage::{StorageConfig, StorageEngine};
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> RuleRegistry {
        let catalog = Arc::new(
            Catalog::new(vec![
                EntityType::new("Folder")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("Name", ScalarType::String))
                    .with_field(FieldDef::new("OwnerId", ScalarType::Int32))
                    .with_field(FieldDef::optional("Secret", ScalarType::String))
                    .with_navigation(NavigationDef::collection("Items", "Item", "FolderId")),
                EntityType::new("SharedFolder").with_parent("Folder"),
                EntityType::new("Item")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("FolderId", ScalarType::Int32))
                    .with_field(FieldDef::optional("TagId", ScalarType::Int32))
                    .with_navigation(NavigationDef::reference("Tag", "Tag", "TagId")),
                EntityType::new("Tag")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("Label", ScalarType::String)),
            ])
            .unwrap(),
        );
        RuleRegistry::builder(catalog)
            .register(
                "Folder",
                RuleSet::new()
                    .all(SecurityRule::allow())
                    .ignore("Secret", IgnoreCondition::Always)
                    .read_only("OwnerId"),
            )
            .register("Item", RuleSet::new().all(SecurityRule::allow()))
            .register("Tag", RuleSet::new().all(SecurityRule::allow()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_shared_reference_is_one_instance() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let tracker = ChangeTracker::new();
        let payload = json!({
            "Name": "docs",
            "OwnerId": 2,
            "Items": [
                {"Tag": {"$id": "t1", "Label": "urgent"}},
                {"Tag": {"$ref": "t1"}}
            ]
        });
        let handles = GraphBuilder::new(&registry, &engine, &tracker)
            .build("Folder", &payload)
            .unwrap();
        assert_eq!(handles.len(), 1);

        let tags: Vec<_> = tracker
            .links()
            .into_iter()
            .filter(|l| l.navigation.name == "Tag")
            .map(|l| l.target)
            .collect();
        assert_eq!(tags.len(), 2);
        assert!(Arc::ptr_eq(&tags[0], &tags[1]));
        // folder, two items, one tag
        assert_eq!(tracker.len(), 4);
    }

    #[test]
    fn test_existing_rows_are_loaded_and_modified() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let stored = row(
            "SharedFolder",
            &[
                ("Id", Value::Int32(1)),
                ("Name", Value::from("old")),
                ("OwnerId", Value::Int32(2)),
            ],
        );
        engine
            .put("Folder", &RowKey::from_values([&Value::Int32(1)]).unwrap(), &stored)
            .unwrap();

        let tracker = ChangeTracker::new();
        let handle = GraphBuilder::new(&registry, &engine, &tracker)
            .build_one(
                "Folder",
                &json!({"Id": 1, "Name": "new", "OwnerId": 9, "Secret": "x"}),
            )
            .unwrap();
        let entity = handle.read();
        assert_eq!(entity.state(), EntityState::Modified);
        assert_eq!(entity.entity(), "SharedFolder");
        assert_eq!(entity.get("Name"), Some(&Value::from("new")));
        // read-only and ignored properties are skipped
        assert_eq!(entity.get("OwnerId"), Some(&Value::Int32(2)));
        assert_eq!(entity.get("Secret"), None);
    }

    #[test]
    fn test_deleted_marker() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let stored = row("Tag", &[("Id", Value::Int32(4)), ("Label", Value::from("a"))]);
        engine
            .put("Tag", &RowKey::from_values([&Value::Int32(4)]).unwrap(), &stored)
            .unwrap();
        let tracker = ChangeTracker::new();
        let mut builder = GraphBuilder::new(&registry, &engine, &tracker);
        let handle = builder
            .build_one("Tag", &json!({"Id": 4, "$deleted": true}))
            .unwrap();
        assert_eq!(handle.read().state(), EntityState::Deleted);

        assert!(builder
            .build_one("Tag", &json!({"Id": 5, "$deleted": true}))
            .is_err());
    }

    #[test]
    fn test_rejects_bad_payloads() {
        let registry = registry();
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let tracker = ChangeTracker::new();
        let mut builder = GraphBuilder::new(&registry, &engine, &tracker);
        assert!(builder.build_one("Folder", &json!({"$ref": "nope"})).is_err());
        assert!(builder.build_one("Folder", &json!({"$type": "Tag"})).is_err());
        assert!(builder.build_one("Folder", &json!({"Items": 3})).is_err());
        assert!(builder.build_one("Folder", &json!(3)).is_err());
    }
}
