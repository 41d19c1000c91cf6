//! Entity catalog with inheritance.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use warden_lang::{MemberKind, SchemaView};
use warden_proto::Value;

use super::entity::EntityType;
use super::field::{FieldDef, NavigationDef, NavigationKind};
use super::types::ScalarType;
use crate::error::Error;
use crate::storage::RowKey;

/// A member of an entity type, own or inherited.
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    Field(&'a FieldDef),
    Navigation(&'a NavigationDef),
}

/// Validated set of entity types.
///
/// Rows of a whole hierarchy share the table of its root type; keys are
/// declared on the root and inherited by every subtype.
#[derive(Debug, Clone)]
pub struct Catalog {
    entities: HashMap<String, EntityType>,
    /// Declaration order, for stable listings.
    names: Vec<String>,
}

impl Catalog {
    /// Build and validate a catalog.
    pub fn new(entities: impl IntoIterator<Item = EntityType>) -> Result<Self, Error> {
        let mut map = HashMap::new();
        let mut names = Vec::new();
        for entity in entities {
            if map.contains_key(&entity.name) {
                return Err(Error::Catalog(format!(
                    "entity '{}' is declared twice",
                    entity.name
                )));
            }
            names.push(entity.name.clone());
            map.insert(entity.name.clone(), entity);
        }

        let catalog = Self {
            entities: map,
            names,
        };
        catalog.validate()?;
        debug!(entities = catalog.names.len(), "catalog loaded");
        Ok(catalog)
    }

    /// Get an entity type by name.
    pub fn entity(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    /// Get an entity type, failing if it is unknown.
    pub fn get(&self, name: &str) -> Result<&EntityType, Error> {
        self.entity(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Entity names in declaration order.
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// The type followed by its ancestors, nearest first.
    pub fn lineage(&self, name: &str) -> Vec<&EntityType> {
        let mut chain = Vec::new();
        let mut current = self.entity(name);
        while let Some(entity) = current {
            chain.push(entity);
            current = entity.parent.as_deref().and_then(|p| self.entity(p));
        }
        chain
    }

    /// Whether `sub` is `sup` or derives from it.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        self.lineage(sub).iter().any(|e| e.name == sup)
    }

    /// Root of the hierarchy `name` belongs to.
    pub fn root_of(&self, name: &str) -> Option<&str> {
        self.lineage(name).last().map(|e| e.name.as_str())
    }

    /// `name` and every type deriving from it.
    pub fn subtypes(&self, name: &str) -> Vec<&str> {
        self.entity_names()
            .filter(|candidate| self.is_subtype(candidate, name))
            .collect()
    }

    /// Key field names, declared on the hierarchy root.
    pub fn keys(&self, name: &str) -> &[String] {
        self.lineage(name)
            .last()
            .map(|root| root.keys.as_slice())
            .unwrap_or(&[])
    }

    /// Own or inherited member.
    pub fn member(&self, entity: &str, name: &str) -> Option<Member<'_>> {
        self.lineage(entity).into_iter().find_map(|e| {
            e.get_field(name)
                .map(Member::Field)
                .or_else(|| e.get_navigation(name).map(Member::Navigation))
        })
    }

    /// Own or inherited field.
    pub fn field(&self, entity: &str, name: &str) -> Option<&FieldDef> {
        match self.member(entity, name)? {
            Member::Field(field) => Some(field),
            Member::Navigation(_) => None,
        }
    }

    /// Own or inherited navigation.
    pub fn navigation(&self, entity: &str, name: &str) -> Option<&NavigationDef> {
        match self.member(entity, name)? {
            Member::Navigation(nav) => Some(nav),
            Member::Field(_) => None,
        }
    }

    /// All fields, ancestors' first.
    pub fn fields(&self, entity: &str) -> Vec<&FieldDef> {
        self.lineage(entity)
            .into_iter()
            .rev()
            .flat_map(|e| e.fields.iter())
            .collect()
    }

    /// All navigations, ancestors' first.
    pub fn navigations(&self, entity: &str) -> Vec<&NavigationDef> {
        self.lineage(entity)
            .into_iter()
            .rev()
            .flat_map(|e| e.navigations.iter())
            .collect()
    }

    /// Key of a row of type `entity`, if every key field holds a key value.
    pub fn key_of(&self, entity: &str, row: &Value) -> Option<RowKey> {
        let keys = self.keys(entity);
        if keys.is_empty() {
            return None;
        }
        RowKey::from_values(keys.iter().map(|k| row.field(k).unwrap_or(&Value::Null)))
    }

    /// The single key field of an entity type, if its key has one column.
    pub fn single_key(&self, entity: &str) -> Option<&FieldDef> {
        match self.keys(entity) {
            [key] => self.field(entity, key),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        for name in &self.names {
            self.validate_lineage(name)?;
        }
        for name in &self.names {
            self.validate_members(name)?;
        }
        Ok(())
    }

    fn validate_lineage(&self, name: &str) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let mut current = name;
        loop {
            if !seen.insert(current) {
                return Err(Error::Catalog(format!(
                    "inheritance cycle through '{}'",
                    current
                )));
            }
            let entity = self.get(current)?;
            match entity.parent.as_deref() {
                Some(parent) => {
                    if !self.contains(parent) {
                        return Err(Error::Catalog(format!(
                            "'{}' derives from unknown entity '{}'",
                            current, parent
                        )));
                    }
                    if !entity.keys.is_empty() {
                        return Err(Error::Catalog(format!(
                            "'{}' declares keys but derives from '{}'; keys belong to the hierarchy root",
                            current, parent
                        )));
                    }
                    current = parent;
                }
                None => {
                    if entity.keys.is_empty() {
                        return Err(Error::Catalog(format!("'{}' has no key", current)));
                    }
                    return Ok(());
                }
            }
        }
    }

    fn validate_members(&self, name: &str) -> Result<(), Error> {
        let mut member_names = HashSet::new();
        for entity in self.lineage(name) {
            let own = entity
                .fields
                .iter()
                .map(|f| f.name.as_str())
                .chain(entity.navigations.iter().map(|n| n.name.as_str()));
            for member in own {
                if !member_names.insert(member) {
                    return Err(Error::Catalog(format!(
                        "member '{}' of '{}' is declared more than once",
                        member, name
                    )));
                }
            }
        }

        let entity = self.get(name)?;
        for key in &entity.keys {
            let field = entity.get_field(key).ok_or_else(|| {
                Error::Catalog(format!("key '{}' of '{}' is not a field", key, name))
            })?;
            if field.nullable || field.scalar_type == ScalarType::Float64 {
                return Err(Error::Catalog(format!(
                    "key '{}' of '{}' must be a non-nullable bool, integer or string",
                    key, name
                )));
            }
        }

        for nav in &entity.navigations {
            if !self.contains(&nav.target) {
                return Err(Error::Catalog(format!(
                    "navigation '{}.{}' targets unknown entity '{}'",
                    name, nav.name, nav.target
                )));
            }
            match &nav.kind {
                NavigationKind::Reference { foreign_key } => {
                    if self.field(name, foreign_key).is_none() {
                        return Err(Error::Catalog(format!(
                            "navigation '{}.{}' uses missing foreign key '{}'",
                            name, nav.name, foreign_key
                        )));
                    }
                    if self.single_key(&nav.target).is_none() {
                        return Err(Error::Catalog(format!(
                            "navigation '{}.{}' needs '{}' to have a single-column key",
                            name, nav.name, nav.target
                        )));
                    }
                }
                NavigationKind::Collection { inverse_key } => {
                    if self.field(&nav.target, inverse_key).is_none() {
                        return Err(Error::Catalog(format!(
                            "navigation '{}.{}' uses missing inverse key '{}.{}'",
                            name, nav.name, nav.target, inverse_key
                        )));
                    }
                    if self.single_key(name).is_none() {
                        return Err(Error::Catalog(format!(
                            "collection '{}.{}' needs '{}' to have a single-column key",
                            name, nav.name, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl SchemaView for Catalog {
    fn has_entity(&self, entity: &str) -> bool {
        self.contains(entity)
    }

    fn member(&self, entity: &str, name: &str) -> Option<MemberKind> {
        match Catalog::member(self, entity, name)? {
            Member::Field(_) => Some(MemberKind::Scalar),
            Member::Navigation(nav) => Some(match nav.kind {
                NavigationKind::Reference { .. } => MemberKind::Reference(nav.target.clone()),
                NavigationKind::Collection { .. } => MemberKind::Collection(nav.target.clone()),
            }),
        }
    }

    fn member_names(&self, entity: &str) -> Vec<String> {
        self.lineage(entity)
            .into_iter()
            .flat_map(|e| {
                e.fields
                    .iter()
                    .map(|f| f.name.clone())
                    .chain(e.navigations.iter().map(|n| n.name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyPart;

    fn documents() -> Vec<EntityType> {
        vec![
            EntityType::new("Document")
                .with_key("Id", ScalarType::Int32)
                .with_field(FieldDef::new("OwnerId", ScalarType::Int32))
                .with_field(FieldDef::optional("FolderId", ScalarType::Int32))
                .with_navigation(NavigationDef::reference("Folder", "Folder", "FolderId")),
            EntityType::new("Invoice")
                .with_parent("Document")
                .with_field(FieldDef::new("Amount", ScalarType::Float64)),
            EntityType::new("Folder")
                .with_key("Id", ScalarType::Int32)
                .with_navigation(NavigationDef::collection("Documents", "Document", "FolderId")),
        ]
    }

    #[test]
    fn test_lineage_and_subtypes() {
        let catalog = Catalog::new(documents()).unwrap();
        let names: Vec<_> = catalog.lineage("Invoice").iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["Invoice", "Document"]);
        assert!(catalog.is_subtype("Invoice", "Document"));
        assert!(catalog.is_subtype("Document", "Document"));
        assert!(!catalog.is_subtype("Document", "Invoice"));
        assert_eq!(catalog.root_of("Invoice"), Some("Document"));
        assert_eq!(catalog.subtypes("Document"), vec!["Document", "Invoice"]);
    }

    #[test]
    fn test_inherited_members() {
        let catalog = Catalog::new(documents()).unwrap();
        assert!(catalog.field("Invoice", "OwnerId").is_some());
        assert!(catalog.navigation("Invoice", "Folder").is_some());
        assert_eq!(catalog.keys("Invoice"), &["Id".to_string()]);
        let fields: Vec<_> = catalog.fields("Invoice").iter().map(|f| f.name.clone()).collect();
        assert_eq!(fields, vec!["Id", "OwnerId", "FolderId", "Amount"]);
    }

    #[test]
    fn test_schema_view() {
        let catalog = Catalog::new(documents()).unwrap();
        let view: &dyn SchemaView = &catalog;
        assert_eq!(view.member("Invoice", "Amount"), Some(MemberKind::Scalar));
        assert_eq!(
            view.member("Folder", "Documents"),
            Some(MemberKind::Collection("Document".into()))
        );
        assert!(view.member_names("Invoice").contains(&"OwnerId".to_string()));
    }

    #[test]
    fn test_key_of() {
        let catalog = Catalog::new(documents()).unwrap();
        let mut row = std::collections::BTreeMap::new();
        row.insert("Id".to_string(), Value::Int32(4));
        let key = catalog.key_of("Invoice", &Value::Object(row)).unwrap();
        assert_eq!(key, RowKey::single(KeyPart::Int(4)));
        assert!(catalog.key_of("Invoice", &Value::Null).is_none());
    }

    #[test]
    fn test_rejects_unknown_parent() {
        let err = Catalog::new(vec![EntityType::new("A").with_parent("B")]).unwrap_err();
        assert!(err.to_string().contains("unknown entity 'B'"));
    }

    #[test]
    fn test_rejects_cycle() {
        let err = Catalog::new(vec![
            EntityType::new("A").with_parent("B"),
            EntityType::new("B").with_parent("A"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_missing_key_and_bad_navigation() {
        assert!(Catalog::new(vec![EntityType::new("A")]).is_err());

        let err = Catalog::new(vec![EntityType::new("A")
            .with_key("Id", ScalarType::Int32)
            .with_navigation(NavigationDef::reference("B", "B", "BId"))])
        .unwrap_err();
        assert!(err.to_string().contains("unknown entity 'B'"));

        let err = Catalog::new(vec![EntityType::new("A")
            .with_key("Id", ScalarType::Int32)
            .with_navigation(NavigationDef::reference("Self", "A", "SelfId"))])
        .unwrap_err();
        assert!(err.to_string().contains("missing foreign key"));
    }

    #[test]
    fn test_rejects_duplicate_member() {
        let err = Catalog::new(vec![
            EntityType::new("A").with_key("Id", ScalarType::Int32),
            EntityType::new("B")
                .with_parent("A")
                .with_field(FieldDef::new("Id", ScalarType::Int32)),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
