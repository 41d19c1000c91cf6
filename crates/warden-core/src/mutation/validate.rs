//! Field validation for pending writes.
//!
//! The validator checks one entity per call and appends to a shared error
//! list, so a save reports every problem of every entity at once.

use super::tracker::TrackedEntity;
use crate::catalog::{Catalog, FieldDef};
use crate::security::{FieldError, Operation, RuleRegistry};

/// Field validator for inserts, updates and deletes.
pub struct FieldValidator<'a> {
    catalog: &'a Catalog,
    registry: &'a RuleRegistry,
}

impl<'a> FieldValidator<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a RuleRegistry) -> Self {
        Self { catalog, registry }
    }

    /// Validate one entity. Accepted values are replaced by their stored
    /// form (`Int32` widened to `Int64` for an `Int64` column, and so on).
    ///
    /// `linked` names fields a relationship fills in at save time.
    pub fn validate(
        &self,
        operation: Operation,
        entity: &mut TrackedEntity,
        linked: &[String],
        errors: &mut Vec<FieldError>,
    ) {
        let name = entity.entity().to_string();
        if !self.catalog.contains(&name) {
            errors.push(FieldError::new(name, "unknown entity type"));
            return;
        }
        match operation {
            Operation::Insert => self.validate_insert(&name, entity, linked, errors),
            Operation::Update => self.validate_update(&name, entity, errors),
            Operation::Delete => self.require_key(&name, entity, errors),
            Operation::Select => {}
        }
    }

    /// Checks:
    /// - every supplied value belongs to a known field and has its type
    /// - every required field is supplied, defaulted, linked or generated
    fn validate_insert(
        &self,
        entity: &str,
        tracked: &mut TrackedEntity,
        linked: &[String],
        errors: &mut Vec<FieldError>,
    ) {
        let names: Vec<String> = tracked.values().keys().cloned().collect();
        self.check_values(entity, tracked, &names, errors);

        for field in self.catalog.fields(entity) {
            if tracked.get(&field.name).is_some()
                || field.nullable
                || field.default.is_some()
                || linked.contains(&field.name)
                || self.is_generated_key(entity, field)
            {
                continue;
            }
            errors.push(FieldError::new(path(entity, &field.name), "is required"));
        }
    }

    /// Checks:
    /// - the key is present and unchanged
    /// - changed values belong to known fields and have their type
    /// - no read-only field changed
    fn validate_update(&self, entity: &str, tracked: &mut TrackedEntity, errors: &mut Vec<FieldError>) {
        self.require_key(entity, tracked, errors);

        let changed: Vec<String> = tracked
            .changed_fields()
            .into_iter()
            .map(str::to_string)
            .collect();
        let keys = self.catalog.keys(entity);
        let flags = self.registry.property_flags(entity);
        for name in &changed {
            if keys.contains(name) {
                errors.push(FieldError::new(path(entity, name), "key cannot change"));
            } else if flags.is_read_only(name) {
                errors.push(FieldError::new(path(entity, name), "is read-only"));
            }
        }
        self.check_values(entity, tracked, &changed, errors);
    }

    fn require_key(&self, entity: &str, tracked: &TrackedEntity, errors: &mut Vec<FieldError>) {
        if tracked.key(self.catalog).is_none() {
            errors.push(FieldError::new(entity, "key is required"));
        }
    }

    fn check_values(
        &self,
        entity: &str,
        tracked: &mut TrackedEntity,
        names: &[String],
        errors: &mut Vec<FieldError>,
    ) {
        for name in names {
            let Some(value) = tracked.get(name) else {
                continue;
            };
            let Some(field) = self.catalog.field(entity, name) else {
                errors.push(FieldError::new(path(entity, name), "unknown field"));
                continue;
            };
            match field.check(value) {
                Ok(stored) => {
                    tracked.values_mut().insert(name.clone(), stored);
                }
                Err(reason) => errors.push(FieldError::new(path(entity, name), reason)),
            }
        }
    }

    /// Integer single-column keys are assigned on insert when missing.
    pub fn is_generated_key(&self, entity: &str, field: &FieldDef) -> bool {
        self.catalog
            .single_key(entity)
            .is_some_and(|key| key.name == field.name && key.scalar_type.is_integer())
    }
}

fn path(entity: &str, field: &str) -> String {
    format!("{}.{}", entity, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityType, FieldDef, ScalarType};
    use crate::security::{RuleSet, SecurityRule};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use warden_proto::Value;

    fn registry() -> RuleRegistry {
        let catalog = Arc::new(
            Catalog::new(vec![
                EntityType::new("Folder")
                    .with_key("Id", ScalarType::Int64)
                    .with_field(FieldDef::new("Name", ScalarType::String))
                    .with_field(FieldDef::new("OwnerId", ScalarType::Int32))
                    .with_field(FieldDef::new("Status", ScalarType::String).with_default("active"))
                    .with_field(FieldDef::optional("ParentId", ScalarType::Int64)),
                EntityType::new("Tag")
                    .with_key("Code", ScalarType::String)
                    .with_field(FieldDef::new("FolderId", ScalarType::Int64)),
            ])
            .unwrap(),
        );
        RuleRegistry::builder(catalog)
            .register("Folder", RuleSet::new().all(SecurityRule::allow()).read_only("OwnerId"))
            .register("Tag", RuleSet::new().all(SecurityRule::allow()))
            .build()
            .unwrap()
    }

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_insert_errors_are_aggregated() {
        let registry = registry();
        let validator = FieldValidator::new(registry.catalog(), &registry);
        let mut entity = TrackedEntity::added(
            "Folder",
            values(&[("Name", Value::Int32(3)), ("Colour", Value::from("red"))]),
        );
        let mut errors = Vec::new();
        validator.validate(Operation::Insert, &mut entity, &[], &mut errors);
        assert_eq!(
            fields(&errors),
            vec!["Folder.Colour", "Folder.Name", "Folder.OwnerId"]
        );
    }

    #[test]
    fn test_insert_coerces_and_accepts_generated_key() {
        let registry = registry();
        let validator = FieldValidator::new(registry.catalog(), &registry);
        let mut entity = TrackedEntity::added(
            "Folder",
            values(&[("Name", Value::from("a")), ("OwnerId", Value::Int32(2)), ("ParentId", Value::Int32(1))]),
        );
        let mut errors = Vec::new();
        validator.validate(Operation::Insert, &mut entity, &[], &mut errors);
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(entity.get("ParentId"), Some(&Value::Int64(1)));
    }

    #[test]
    fn test_linked_fields_are_not_required() {
        let registry = registry();
        let validator = FieldValidator::new(registry.catalog(), &registry);
        let mut entity = TrackedEntity::added("Tag", values(&[("Code", Value::from("t"))]));
        let mut errors = Vec::new();
        validator.validate(Operation::Insert, &mut entity, &["FolderId".to_string()], &mut errors);
        assert!(errors.is_empty());

        // string keys are never generated
        let mut entity = TrackedEntity::added("Tag", BTreeMap::new());
        validator.validate(Operation::Insert, &mut entity, &["FolderId".to_string()], &mut errors);
        assert_eq!(fields(&errors), vec!["Tag.Code"]);
    }

    #[test]
    fn test_update_rejects_read_only_and_key_changes() {
        let registry = registry();
        let validator = FieldValidator::new(registry.catalog(), &registry);
        let row = crate::storage::engine::tests::row(
            "Folder",
            &[
                ("Id", Value::Int64(1)),
                ("Name", Value::from("a")),
                ("OwnerId", Value::Int32(2)),
            ],
        );
        let mut entity = TrackedEntity::loaded("Folder", &row);
        entity.set("OwnerId", 3);
        entity.set("Name", "b");
        let mut errors = Vec::new();
        validator.validate(Operation::Update, &mut entity, &[], &mut errors);
        assert_eq!(fields(&errors), vec!["Folder.OwnerId"]);
        assert_eq!(errors[0].reason, "is read-only");

        entity.set("Id", 9i64);
        let mut errors = Vec::new();
        validator.validate(Operation::Update, &mut entity, &[], &mut errors);
        assert!(errors.iter().any(|e| e.reason == "key cannot change"));
    }

    #[test]
    fn test_delete_requires_key() {
        let registry = registry();
        let validator = FieldValidator::new(registry.catalog(), &registry);
        let mut entity = TrackedEntity::added("Folder", BTreeMap::new());
        let mut errors = Vec::new();
        validator.validate(Operation::Delete, &mut entity, &[], &mut errors);
        assert_eq!(fields(&errors), vec!["Folder"]);
    }
}
