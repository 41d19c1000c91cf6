//! Security rules and per-type rule sets.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warden_proto::{Lambda, QueryPlan};

use super::error::SecurityResult;
use super::ignore::IgnoreCondition;
use super::principal::Principal;
use crate::catalog::Catalog;

/// Operations a rule can govern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// All operations.
    pub const ALL: [Operation; 4] = [
        Operation::Select,
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signature of a rule: narrow a plan for a principal.
pub type RuleFn = dyn Fn(&QueryPlan, &Principal) -> SecurityResult<QueryPlan> + Send + Sync;

/// A named rule function.
#[derive(Clone)]
pub struct SecurityRule {
    name: String,
    func: Arc<RuleFn>,
}

impl SecurityRule {
    /// Wrap an arbitrary rule function.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&QueryPlan, &Principal) -> SecurityResult<QueryPlan> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Rule that leaves the plan unchanged.
    pub fn allow() -> Self {
        Self::new("allow", |plan, _| Ok(plan.clone()))
    }

    /// Rule that keeps no rows.
    pub fn deny() -> Self {
        Self::new("deny", |plan, _| Ok(plan.filter(Lambda::constant(false))))
    }

    /// Rule appending a principal-dependent predicate.
    pub fn filter<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Principal) -> Lambda + Send + Sync + 'static,
    {
        Self::new(name, move |plan, principal| Ok(plan.filter(predicate(principal))))
    }

    /// Rule appending a predicate that references `$principal`.
    pub fn predicate(name: impl Into<String>, predicate: Lambda) -> Self {
        Self::new(name, move |plan, principal| {
            let body = predicate.body.bind_principal(principal.value());
            Ok(plan.filter(Lambda {
                param: predicate.param.clone(),
                body: Box::new(body),
            }))
        })
    }

    /// Rule name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the rule to a plan.
    pub fn apply(&self, plan: &QueryPlan, principal: &Principal) -> SecurityResult<QueryPlan> {
        (self.func)(plan, principal)
    }
}

impl fmt::Debug for SecurityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityRule").field("name", &self.name).finish()
    }
}

/// Rules and property metadata registered for one entity type.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<Operation, SecurityRule>,
    ignored: HashMap<String, IgnoreCondition>,
    read_only: HashSet<String>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rule for one operation.
    pub fn with_rule(mut self, operation: Operation, rule: SecurityRule) -> Self {
        self.rules.insert(operation, rule);
        self
    }

    pub fn select(self, rule: SecurityRule) -> Self {
        self.with_rule(Operation::Select, rule)
    }

    pub fn insert(self, rule: SecurityRule) -> Self {
        self.with_rule(Operation::Insert, rule)
    }

    pub fn update(self, rule: SecurityRule) -> Self {
        self.with_rule(Operation::Update, rule)
    }

    pub fn delete(self, rule: SecurityRule) -> Self {
        self.with_rule(Operation::Delete, rule)
    }

    /// Use the same rule for every operation.
    pub fn all(mut self, rule: SecurityRule) -> Self {
        for operation in Operation::ALL {
            self.rules.insert(operation, rule.clone());
        }
        self
    }

    /// Flag a property as ignored.
    pub fn ignore(mut self, property: impl Into<String>, condition: IgnoreCondition) -> Self {
        self.ignored.insert(property.into(), condition);
        self
    }

    /// Flag a property as read-only for existing rows.
    pub fn read_only(mut self, property: impl Into<String>) -> Self {
        self.read_only.insert(property.into());
        self
    }

    /// Own rule for an operation.
    pub fn rule(&self, operation: Operation) -> Option<&SecurityRule> {
        self.rules.get(&operation)
    }

    pub(crate) fn ignored(&self) -> &HashMap<String, IgnoreCondition> {
        &self.ignored
    }

    pub(crate) fn read_only_properties(&self) -> &HashSet<String> {
        &self.read_only
    }
}

/// A declarative rule: `allow`, `deny`, or a predicate text such as
/// `x => x.OwnerId == $principal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyRule {
    Allow,
    Deny,
    Predicate(String),
}

impl PolicyRule {
    /// Compile into a rule over `entity`.
    pub fn compile(&self, catalog: &Catalog, entity: &str) -> SecurityResult<SecurityRule> {
        match self {
            PolicyRule::Allow => Ok(SecurityRule::allow()),
            PolicyRule::Deny => Ok(SecurityRule::deny()),
            PolicyRule::Predicate(text) => {
                let lambda = warden_lang::compile_predicate(catalog, entity, text)?;
                Ok(SecurityRule::predicate(text.clone(), lambda))
            }
        }
    }
}

impl From<String> for PolicyRule {
    fn from(text: String) -> Self {
        match text.trim() {
            "allow" => PolicyRule::Allow,
            "deny" => PolicyRule::Deny,
            _ => PolicyRule::Predicate(text),
        }
    }
}

impl From<PolicyRule> for String {
    fn from(rule: PolicyRule) -> Self {
        match rule {
            PolicyRule::Allow => "allow".to_string(),
            PolicyRule::Deny => "deny".to_string(),
            PolicyRule::Predicate(text) => text,
        }
    }
}
