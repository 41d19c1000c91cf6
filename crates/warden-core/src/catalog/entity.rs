//! Entity type definitions.

use serde::{Deserialize, Serialize};

use super::field::{FieldDef, NavigationDef};
use super::types::ScalarType;

/// An entity type: keys, scalar fields, navigations and an optional parent.
///
/// Key fields are declared on the root of a hierarchy; subtypes inherit them
/// along with every other member of their ancestors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Entity name (unique within the catalog).
    pub name: String,
    /// Direct supertype.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Names of the key fields.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Own scalar fields.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Own navigations.
    #[serde(default)]
    pub navigations: Vec<NavigationDef>,
}

impl EntityType {
    /// Create a new entity type with no members.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            keys: Vec::new(),
            fields: Vec::new(),
            navigations: Vec::new(),
        }
    }

    /// Derive this type from `parent`.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Add a key field.
    pub fn with_key(mut self, name: impl Into<String>, scalar_type: ScalarType) -> Self {
        let name = name.into();
        self.keys.push(name.clone());
        self.fields.push(FieldDef::new(name, scalar_type));
        self
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a navigation.
    pub fn with_navigation(mut self, navigation: NavigationDef) -> Self {
        self.navigations.push(navigation);
        self
    }

    /// Get an own field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Get an own navigation by name.
    pub fn get_navigation(&self, name: &str) -> Option<&NavigationDef> {
        self.navigations.iter().find(|n| n.name == name)
    }
}
