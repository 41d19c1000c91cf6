//! Property visibility and write-protection metadata.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use warden_proto::Value;

/// When a property is hidden from projections and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IgnoreCondition {
    /// Always visible.
    #[default]
    Never,
    /// Never observable; reads yield the typed default.
    Always,
    /// Omitted from serialized output when the value is null.
    WhenWritingNull,
}

impl IgnoreCondition {
    /// Whether reads must not observe the property at all.
    pub fn hides_reads(&self) -> bool {
        matches!(self, IgnoreCondition::Always)
    }

    /// Whether the serializer drops this value.
    pub fn omits(&self, value: &Value) -> bool {
        match self {
            IgnoreCondition::Never => false,
            IgnoreCondition::Always => true,
            IgnoreCondition::WhenWritingNull => value.is_null(),
        }
    }
}

/// Effective ignore and read-only flags of one entity type, merged over its
/// ancestor chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyFlags {
    ignored: HashMap<String, IgnoreCondition>,
    read_only: HashSet<String>,
}

impl PropertyFlags {
    pub fn new(ignored: HashMap<String, IgnoreCondition>, read_only: HashSet<String>) -> Self {
        Self { ignored, read_only }
    }

    /// Ignore condition of a property (`Never` when unflagged).
    pub fn ignore_condition(&self, property: &str) -> IgnoreCondition {
        self.ignored.get(property).copied().unwrap_or_default()
    }

    /// Whether reads of the property are replaced by a default.
    pub fn is_hidden(&self, property: &str) -> bool {
        self.ignore_condition(property).hides_reads()
    }

    pub fn is_read_only(&self, property: &str) -> bool {
        self.read_only.contains(property)
    }

    /// Flagged properties and their conditions.
    pub fn ignored(&self) -> &HashMap<String, IgnoreCondition> {
        &self.ignored
    }

    pub fn read_only(&self) -> &HashSet<String> {
        &self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_omits() {
        assert!(IgnoreCondition::Always.omits(&Value::Int32(1)));
        assert!(IgnoreCondition::WhenWritingNull.omits(&Value::Null));
        assert!(!IgnoreCondition::WhenWritingNull.omits(&Value::Int32(1)));
        assert!(!IgnoreCondition::Never.omits(&Value::Null));
    }

    #[test]
    fn test_flags_lookup() {
        let mut ignored = HashMap::new();
        ignored.insert("Secret".to_string(), IgnoreCondition::Always);
        ignored.insert("Note".to_string(), IgnoreCondition::WhenWritingNull);
        let flags = PropertyFlags::new(ignored, ["OwnerId".to_string()].into());

        assert!(flags.is_hidden("Secret"));
        assert!(!flags.is_hidden("Note"));
        assert_eq!(flags.ignore_condition("Name"), IgnoreCondition::Never);
        assert!(flags.is_read_only("OwnerId"));
    }

    #[test]
    fn test_serde_names() {
        let cond: IgnoreCondition = serde_json::from_str("\"whenWritingNull\"").unwrap();
        assert_eq!(cond, IgnoreCondition::WhenWritingNull);
    }
}
