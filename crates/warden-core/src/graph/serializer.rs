//! Serialize query results to JSON.
//!
//! Entity objects are written with their type's ignore metadata applied.
//! An entity that occurs more than once in a result is written in full the
//! first time, tagged with `$id`, and as `{"$ref": id}` afterwards.

use std::collections::{HashMap, HashSet};

use serde_json::Map;
use warden_proto::{Value, TYPE_TAG};

use super::builder::{ID_TAG, REF_TAG};
use crate::security::RuleRegistry;

/// Identity of an entity row: hierarchy root and encoded key.
type Identity = (String, Vec<u8>);

pub struct Serializer<'a> {
    registry: &'a RuleRegistry,
}

impl<'a> Serializer<'a> {
    pub fn new(registry: &'a RuleRegistry) -> Self {
        Self { registry }
    }

    /// Serialize one value.
    pub fn to_json(&self, value: &Value) -> serde_json::Value {
        let mut seen = HashSet::new();
        let mut repeated = HashSet::new();
        self.count(value, &mut seen, &mut repeated);

        let mut ids = HashMap::new();
        self.write(value, &repeated, &mut ids)
    }

    /// Serialize result rows as a JSON array, sharing one reference table.
    pub fn rows_to_json(&self, rows: &[Value]) -> serde_json::Value {
        self.to_json(&Value::List(rows.to_vec()))
    }

    fn identity(&self, value: &Value) -> Option<Identity> {
        let entity = value.entity_type()?;
        let catalog = self.registry.catalog();
        let root = catalog.root_of(entity)?;
        let key = catalog.key_of(entity, value)?;
        Some((root.to_string(), key.encode()))
    }

    /// First pass: find entities that occur more than once.
    fn count(&self, value: &Value, seen: &mut HashSet<Identity>, repeated: &mut HashSet<Identity>) {
        match value {
            Value::List(items) => {
                for item in items {
                    self.count(item, seen, repeated);
                }
            }
            Value::Object(map) => {
                if let Some(identity) = self.identity(value) {
                    if !seen.insert(identity.clone()) {
                        repeated.insert(identity);
                        return;
                    }
                }
                for item in map.values() {
                    self.count(item, seen, repeated);
                }
            }
            _ => {}
        }
    }

    fn write(
        &self,
        value: &Value,
        repeated: &HashSet<Identity>,
        ids: &mut HashMap<Identity, String>,
    ) -> serde_json::Value {
        match value {
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(|item| self.write(item, repeated, ids)).collect(),
            ),
            Value::Object(map) => {
                let identity = self.identity(value).filter(|id| repeated.contains(id));
                if let Some(identity) = &identity {
                    if let Some(id) = ids.get(identity) {
                        let mut reference = Map::new();
                        reference.insert(REF_TAG.to_string(), serde_json::Value::String(id.clone()));
                        return serde_json::Value::Object(reference);
                    }
                }

                let mut out = Map::new();
                if let Some(identity) = identity {
                    let id = (ids.len() + 1).to_string();
                    ids.insert(identity, id.clone());
                    out.insert(ID_TAG.to_string(), serde_json::Value::String(id));
                }
                let flags = value
                    .entity_type()
                    .map(|entity| self.registry.property_flags(entity));
                for (name, field) in map {
                    if name != TYPE_TAG {
                        if let Some(flags) = &flags {
                            if flags.ignore_condition(name).omits(field) {
                                continue;
                            }
                        }
                    }
                    out.insert(name.clone(), self.write(field, repeated, ids));
                }
                serde_json::Value::Object(out)
            }
            scalar => scalar.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, EntityType, FieldDef, ScalarType};
    use crate::security::{IgnoreCondition, RuleSet, SecurityRule};
    use crate::storage::engine::tests::row;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> RuleRegistry {
        let catalog = Arc::new(
            Catalog::new(vec![
                EntityType::new("User")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("Name", ScalarType::String))
                    .with_field(FieldDef::optional("Password", ScalarType::String))
                    .with_field(FieldDef::optional("Nickname", ScalarType::String)),
                EntityType::new("Note")
                    .with_key("Id", ScalarType::Int32)
                    .with_field(FieldDef::new("AuthorId", ScalarType::Int32)),
            ])
            .unwrap(),
        );
        RuleRegistry::builder(catalog)
            .register(
                "User",
                RuleSet::new()
                    .all(SecurityRule::allow())
                    .ignore("Password", IgnoreCondition::Always)
                    .ignore("Nickname", IgnoreCondition::WhenWritingNull),
            )
            .register("Note", RuleSet::new().all(SecurityRule::allow()))
            .build()
            .unwrap()
    }

    fn user(id: i32, nickname: Value) -> Value {
        row(
            "User",
            &[
                ("Id", Value::Int32(id)),
                ("Name", Value::from("ann")),
                ("Password", Value::from("hunter2")),
                ("Nickname", nickname),
            ],
        )
    }

    #[test]
    fn test_ignore_metadata_is_applied() {
        let registry = registry();
        let json = Serializer::new(&registry).to_json(&user(1, Value::Null));
        assert_eq!(json, json!({"$type": "User", "Id": 1, "Name": "ann"}));

        let json = Serializer::new(&registry).to_json(&user(1, Value::from("a")));
        assert_eq!(json["Nickname"], json!("a"));
        assert!(json.get("Password").is_none());
    }

    #[test]
    fn test_repeated_entities_use_references() {
        let registry = registry();
        let note = |id: i32| {
            let mut note = row("Note", &[("Id", Value::Int32(id)), ("AuthorId", Value::Int32(1))]);
            note.as_object_mut()
                .unwrap()
                .insert("Author".to_string(), user(1, Value::from("a")));
            note
        };
        let json = Serializer::new(&registry).rows_to_json(&[note(1), note(2)]);
        assert_eq!(json[0]["Author"]["$id"], json!("1"));
        assert_eq!(json[0]["Author"]["Name"], json!("ann"));
        assert_eq!(json[1]["Author"], json!({"$ref": "1"}));
        // notes occur once and carry no id
        assert!(json[0].get("$id").is_none());
    }

    #[test]
    fn test_projections_pass_through() {
        let registry = registry();
        let mut record = std::collections::BTreeMap::new();
        record.insert("Password".to_string(), Value::from("visible"));
        let json = Serializer::new(&registry).to_json(&Value::Object(record));
        assert_eq!(json, json!({"Password": "visible"}));
    }
}
