//! JSON configuration: schema, declarative rules and engine settings.
//!
//! ```json
//! {
//!   "entities": [
//!     {"name": "Folder", "keys": ["Id"], "fields": [...], "navigations": [...]}
//!   ],
//!   "rules": {
//!     "Folder": {
//!       "all": "x => x.OwnerId == $principal",
//!       "select": "allow",
//!       "ignore": {"Secret": "always"},
//!       "readOnly": ["OwnerId"]
//!     }
//!   },
//!   "engine": {"includeStrategy": "split", "maxIncludeDepth": 4}
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use warden_core::catalog::{Catalog, EntityType};
use warden_core::security::{IgnoreCondition, Operation, PolicyRule, RuleRegistry, RuleSet};
use warden_core::{EngineConfig, IncludeStrategy};

use crate::error::CliError;

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardenConfig {
    pub entities: Vec<EntityType>,
    #[serde(default)]
    pub rules: BTreeMap<String, RulesConfig>,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Declarative rules for one entity type. Operation-specific rules override
/// `all`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesConfig {
    #[serde(default)]
    pub all: Option<PolicyRule>,
    #[serde(default)]
    pub select: Option<PolicyRule>,
    #[serde(default)]
    pub insert: Option<PolicyRule>,
    #[serde(default)]
    pub update: Option<PolicyRule>,
    #[serde(default)]
    pub delete: Option<PolicyRule>,
    #[serde(default)]
    pub ignore: HashMap<String, IgnoreCondition>,
    #[serde(default)]
    pub read_only: Vec<String>,
}

/// Engine settings; absent values keep the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default)]
    pub compile_cache_capacity: Option<usize>,
    #[serde(default)]
    pub include_strategy: Option<IncludeStrategy>,
    #[serde(default)]
    pub max_include_depth: Option<usize>,
}

impl WardenConfig {
    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CliError> {
        serde_json::from_str(text).map_err(|e| CliError::Config(e.to_string()))
    }

    /// Build the catalog and compile every rule against it.
    pub fn registry(&self) -> Result<RuleRegistry, CliError> {
        let catalog = Arc::new(Catalog::new(self.entities.clone())?);
        let mut builder = RuleRegistry::builder(catalog.clone());
        for (entity, rules) in &self.rules {
            builder = builder.register(entity.clone(), rules.compile(&catalog, entity)?);
        }
        Ok(builder.build()?)
    }

    /// Apply the engine settings on top of `base`.
    pub fn engine_config(&self, base: EngineConfig) -> EngineConfig {
        let mut config = base;
        if let Some(capacity) = self.engine.compile_cache_capacity {
            config = config.with_compile_cache_capacity(capacity);
        }
        if let Some(strategy) = self.engine.include_strategy {
            config = config.with_include_strategy(strategy);
        }
        if let Some(depth) = self.engine.max_include_depth {
            config = config.with_max_include_depth(depth);
        }
        config
    }
}

impl RulesConfig {
    fn compile(&self, catalog: &Catalog, entity: &str) -> Result<RuleSet, CliError> {
        let mut set = RuleSet::new();
        if let Some(all) = &self.all {
            set = set.all(all.compile(catalog, entity)?);
        }
        let specific = [
            (Operation::Select, &self.select),
            (Operation::Insert, &self.insert),
            (Operation::Update, &self.update),
            (Operation::Delete, &self.delete),
        ];
        for (operation, rule) in specific {
            if let Some(rule) = rule {
                set = set.with_rule(operation, rule.compile(catalog, entity)?);
            }
        }
        for (property, condition) in &self.ignore {
            set = set.ignore(property.clone(), *condition);
        }
        for property in &self.read_only {
            set = set.read_only(property.clone());
        }
        Ok(set)
    }
}
