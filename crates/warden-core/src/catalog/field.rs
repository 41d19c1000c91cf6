//! Field and navigation definitions for entities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use warden_proto::Value;

use super::types::ScalarType;

/// A scalar field definition within an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field data type.
    #[serde(rename = "type")]
    pub scalar_type: ScalarType,
    /// Whether the field accepts null.
    #[serde(default)]
    pub nullable: bool,
    /// Column default applied when an insert leaves the field unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_default",
        deserialize_with = "deserialize_default"
    )]
    pub default: Option<Value>,
}

impl FieldDef {
    /// Create a required field.
    pub fn new(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar_type,
            nullable: false,
            default: None,
        }
    }

    /// Create a nullable field.
    pub fn optional(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, scalar_type)
        }
    }

    /// Set the column default.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Constant substituted when the field must not be observed.
    pub fn typed_default(&self) -> Value {
        if self.nullable {
            Value::Null
        } else {
            self.scalar_type.zero()
        }
    }

    /// Check a value against this field's type, returning the stored form.
    pub fn check(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err("must not be null".to_string())
            };
        }
        self.scalar_type
            .coerce(value)
            .ok_or_else(|| format!("expected {}, got {}", self.scalar_type, value.kind()))
    }
}

/// How a navigation is joined to its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationKind {
    /// This row's foreign key points at the target's key.
    Reference {
        #[serde(rename = "foreignKey")]
        foreign_key: String,
    },
    /// Target rows whose foreign key equals this row's key.
    Collection {
        #[serde(rename = "inverseKey")]
        inverse_key: String,
    },
}

/// A navigation property linking an entity to related entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationDef {
    /// Navigation name.
    pub name: String,
    /// Target entity type.
    pub target: String,
    /// Join description.
    #[serde(flatten)]
    pub kind: NavigationKind,
}

impl NavigationDef {
    /// Single-valued navigation through a foreign key on this entity.
    pub fn reference(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: NavigationKind::Reference {
                foreign_key: foreign_key.into(),
            },
        }
    }

    /// Collection navigation through a foreign key on the target.
    pub fn collection(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: NavigationKind::Collection {
                inverse_key: inverse_key.into(),
            },
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NavigationKind::Collection { .. })
    }
}

fn serialize_default<S>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(value) => value.to_json().serialize(serializer),
        None => serializer.serialize_none(),
    }
}

fn deserialize_default<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.map(|json| Value::from_json(&json)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_coerces_and_rejects() {
        let field = FieldDef::new("Size", ScalarType::Int64);
        assert_eq!(field.check(&Value::Int32(3)), Ok(Value::Int64(3)));
        assert!(field.check(&Value::Null).is_err());
        assert!(field.check(&Value::String("x".into())).is_err());

        let optional = FieldDef::optional("Note", ScalarType::String);
        assert_eq!(optional.check(&Value::Null), Ok(Value::Null));
    }

    #[test]
    fn test_typed_default() {
        assert_eq!(FieldDef::new("A", ScalarType::Int32).typed_default(), Value::Int32(0));
        assert_eq!(FieldDef::optional("A", ScalarType::Int32).typed_default(), Value::Null);
    }

    #[test]
    fn test_field_from_json() {
        let field: FieldDef =
            serde_json::from_value(json!({"name": "OwnerId", "type": "int32", "default": 0}))
                .unwrap();
        assert_eq!(field.default, Some(Value::Int32(0)));
        assert!(!field.nullable);
    }

    #[test]
    fn test_navigation_from_json() {
        let nav: NavigationDef = serde_json::from_value(json!({
            "name": "Children",
            "target": "Folder",
            "collection": {"inverseKey": "ParentId"}
        }))
        .unwrap();
        assert_eq!(nav, NavigationDef::collection("Children", "Folder", "ParentId"));
        assert!(nav.is_collection());
    }
}
