//! Rule registry with inheritance-aware resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use warden_proto::QueryPlan;

use super::error::{SecurityError, SecurityResult};
use super::ignore::PropertyFlags;
use super::principal::Principal;
use super::rule::{Operation, RuleSet, SecurityRule};
use crate::catalog::Catalog;
use crate::error::Error;

/// The effective rule for an (entity type, operation) pair.
#[derive(Debug, Clone)]
pub enum ResolvedRule {
    /// The type's own rule.
    Own(SecurityRule),
    /// An ancestor's rule, narrowed back to `entity`.
    Narrowed {
        entity: String,
        ancestor: String,
        rule: SecurityRule,
    },
}

impl ResolvedRule {
    /// Apply the rule to a plan rooted at the resolved type.
    ///
    /// A narrowed rule runs over the ancestor and then keeps only rows of
    /// the subtype.
    pub fn apply(&self, plan: &QueryPlan, principal: &Principal) -> SecurityResult<QueryPlan> {
        match self {
            ResolvedRule::Own(rule) => rule.apply(plan, principal),
            ResolvedRule::Narrowed {
                entity,
                ancestor,
                rule,
            } => {
                let widened = rule.apply(&plan.retarget(ancestor.as_str()), principal)?;
                Ok(widened.of_type(entity.as_str()).retarget(entity.as_str()))
            }
        }
    }

    /// The rule applied to an empty plan over `entity`.
    pub fn base_plan(&self, entity: &str, principal: &Principal) -> SecurityResult<QueryPlan> {
        self.apply(&QueryPlan::new(entity), principal)
    }

    /// Name of the underlying rule.
    pub fn name(&self) -> &str {
        match self {
            ResolvedRule::Own(rule) | ResolvedRule::Narrowed { rule, .. } => rule.name(),
        }
    }
}

/// Collects rule sets before freezing them into a [`RuleRegistry`].
pub struct RuleRegistryBuilder {
    catalog: Arc<Catalog>,
    sets: HashMap<String, RuleSet>,
}

impl RuleRegistryBuilder {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            sets: HashMap::new(),
        }
    }

    /// Register (or replace) the rule set of a type.
    pub fn register(mut self, entity: impl Into<String>, set: RuleSet) -> Self {
        self.sets.insert(entity.into(), set);
        self
    }

    /// Validate the registrations against the catalog.
    pub fn build(self) -> Result<RuleRegistry, Error> {
        for (entity, set) in &self.sets {
            if !self.catalog.contains(entity) {
                return Err(Error::Catalog(format!(
                    "rules registered for unknown entity '{}'",
                    entity
                )));
            }
            let flagged = set
                .ignored()
                .keys()
                .chain(set.read_only_properties().iter());
            for property in flagged {
                if self.catalog.member(entity, property).is_none() {
                    return Err(Error::Catalog(format!(
                        "'{}' has no property '{}' to flag",
                        entity, property
                    )));
                }
            }
        }

        let unruled: Vec<&str> = self
            .catalog
            .entity_names()
            .filter(|name| {
                !self
                    .catalog
                    .lineage(name)
                    .iter()
                    .any(|e| self.sets.contains_key(&e.name))
            })
            .collect();
        if !unruled.is_empty() {
            warn!(entities = ?unruled, "entity types without rules deny all access");
        }
        debug!(registered = self.sets.len(), "rule registry built");

        Ok(RuleRegistry {
            catalog: self.catalog,
            sets: self.sets,
            resolved: DashMap::new(),
            flags: DashMap::new(),
        })
    }
}

/// Immutable per-type rules plus memoized resolution.
///
/// Caches are owned by the registry instance and safe under concurrent
/// readers; a racing first resolution computes the same value twice.
pub struct RuleRegistry {
    catalog: Arc<Catalog>,
    sets: HashMap<String, RuleSet>,
    resolved: DashMap<(String, Operation), Option<ResolvedRule>>,
    flags: DashMap<String, Arc<PropertyFlags>>,
}

impl RuleRegistry {
    pub fn builder(catalog: Arc<Catalog>) -> RuleRegistryBuilder {
        RuleRegistryBuilder::new(catalog)
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Effective rule: own rule, else the nearest ancestor's rule narrowed
    /// to `entity`, else `RuleNotDefined`.
    pub fn resolve(&self, entity: &str, operation: Operation) -> SecurityResult<ResolvedRule> {
        let key = (entity.to_string(), operation);
        let resolved = match self.resolved.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = self.resolve_uncached(entity, operation);
                self.resolved.insert(key, resolved.clone());
                resolved
            }
        };
        resolved.ok_or_else(|| {
            warn!(entity, %operation, "no rule defined");
            SecurityError::RuleNotDefined {
                entity: entity.to_string(),
                operation,
            }
        })
    }

    fn resolve_uncached(&self, entity: &str, operation: Operation) -> Option<ResolvedRule> {
        for (depth, ancestor) in self.catalog.lineage(entity).into_iter().enumerate() {
            let Some(rule) = self
                .sets
                .get(&ancestor.name)
                .and_then(|set| set.rule(operation))
            else {
                continue;
            };
            if depth == 0 {
                return Some(ResolvedRule::Own(rule.clone()));
            }
            debug!(entity, ancestor = %ancestor.name, %operation, "inheriting ancestor rule");
            return Some(ResolvedRule::Narrowed {
                entity: entity.to_string(),
                ancestor: ancestor.name.clone(),
                rule: rule.clone(),
            });
        }
        None
    }

    /// Ignore and read-only flags of a type, merged over its ancestors.
    pub fn property_flags(&self, entity: &str) -> Arc<PropertyFlags> {
        if let Some(flags) = self.flags.get(entity) {
            return flags.clone();
        }
        let mut ignored = HashMap::new();
        let mut read_only = HashSet::new();
        for ancestor in self.catalog.lineage(entity).into_iter().rev() {
            if let Some(set) = self.sets.get(&ancestor.name) {
                ignored.extend(set.ignored().iter().map(|(k, v)| (k.clone(), *v)));
                read_only.extend(set.read_only_properties().iter().cloned());
            }
        }
        let flags = Arc::new(PropertyFlags::new(ignored, read_only));
        self.flags
            .entry(entity.to_string())
            .or_insert(flags)
            .clone()
    }

    /// Whether the type has a rule set of its own.
    pub fn is_registered(&self, entity: &str) -> bool {
        self.sets.contains_key(entity)
    }
}
