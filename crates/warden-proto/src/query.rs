//! Immutable query plans.
//!
//! A [`QueryPlan`] is an operation sequence rooted at an entity type. Every
//! builder method returns a new plan; the receiver is never modified.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::expr::{Expr, Lambda};
use crate::value::Value;

/// One step of a query plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOp {
    /// Keep rows for which the predicate is true.
    Where(Lambda),
    /// Project each row.
    Select(Lambda),
    /// Project each row to a sequence and flatten.
    SelectMany(Lambda),
    /// Primary ordering key.
    OrderBy { key: Lambda, descending: bool },
    /// Secondary ordering key.
    ThenBy { key: Lambda, descending: bool },
    /// Skip the first N rows.
    Skip(usize),
    /// Keep at most N rows.
    Take(usize),
    /// Keep rows whose runtime type is the given type or a subtype of it.
    OfType(String),
    /// Eager-load a navigation path.
    Include(Lambda),
    /// Continue the previous include path.
    ThenInclude(Lambda),
}

impl QueryOp {
    /// Operation name as used in descriptors.
    pub fn name(&self) -> &'static str {
        match self {
            QueryOp::Where(_) => "where",
            QueryOp::Select(_) => "select",
            QueryOp::SelectMany(_) => "selectMany",
            QueryOp::OrderBy { descending: false, .. } => "orderBy",
            QueryOp::OrderBy { descending: true, .. } => "orderByDescending",
            QueryOp::ThenBy { descending: false, .. } => "thenBy",
            QueryOp::ThenBy { descending: true, .. } => "thenByDescending",
            QueryOp::Skip(_) => "skip",
            QueryOp::Take(_) => "take",
            QueryOp::OfType(_) => "ofType",
            QueryOp::Include(_) => "include",
            QueryOp::ThenInclude(_) => "thenInclude",
        }
    }

    /// The lambda argument of this operation, if any.
    pub fn lambda(&self) -> Option<&Lambda> {
        match self {
            QueryOp::Where(l)
            | QueryOp::Select(l)
            | QueryOp::SelectMany(l)
            | QueryOp::Include(l)
            | QueryOp::ThenInclude(l) => Some(l),
            QueryOp::OrderBy { key, .. } | QueryOp::ThenBy { key, .. } => Some(key),
            QueryOp::Skip(_) | QueryOp::Take(_) | QueryOp::OfType(_) => None,
        }
    }

    /// Rebuild this operation with its lambda replaced.
    pub fn try_map_lambda(
        &self,
        f: &mut dyn FnMut(&Lambda) -> Result<Lambda, Error>,
    ) -> Result<QueryOp, Error> {
        let op = match self {
            QueryOp::Where(l) => QueryOp::Where(f(l)?),
            QueryOp::Select(l) => QueryOp::Select(f(l)?),
            QueryOp::SelectMany(l) => QueryOp::SelectMany(f(l)?),
            QueryOp::Include(l) => QueryOp::Include(f(l)?),
            QueryOp::ThenInclude(l) => QueryOp::ThenInclude(f(l)?),
            QueryOp::OrderBy { key, descending } => QueryOp::OrderBy {
                key: f(key)?,
                descending: *descending,
            },
            QueryOp::ThenBy { key, descending } => QueryOp::ThenBy {
                key: f(key)?,
                descending: *descending,
            },
            QueryOp::Skip(_) | QueryOp::Take(_) | QueryOp::OfType(_) => self.clone(),
        };
        Ok(op)
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOp::Skip(n) | QueryOp::Take(n) => write!(f, "{}({})", self.name(), n),
            QueryOp::OfType(ty) => write!(f, "{}({})", self.name(), ty),
            _ => match self.lambda() {
                Some(lambda) => write!(f, "{}({})", self.name(), lambda),
                None => f.write_str(self.name()),
            },
        }
    }
}

/// Paging request: rows `[start, start + size)` of the filtered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Number of rows to skip.
    pub start: usize,
    /// Maximum number of rows to return.
    pub size: usize,
}

impl Page {
    /// Create a page.
    pub fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// First page of the given size.
    pub fn first(size: usize) -> Self {
        Self { start: 0, size }
    }
}

/// An immutable, composable query rooted at an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    root: String,
    ops: Vec<QueryOp>,
}

impl QueryPlan {
    /// Empty plan over all rows of `root` (and its subtypes).
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ops: Vec::new(),
        }
    }

    /// Plan with an explicit operation list.
    pub fn from_ops(root: impl Into<String>, ops: Vec<QueryOp>) -> Self {
        Self {
            root: root.into(),
            ops,
        }
    }

    /// Root entity type.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Operations in application order.
    pub fn ops(&self) -> &[QueryOp] {
        &self.ops
    }

    /// Consume the plan, returning its operations.
    pub fn into_ops(self) -> Vec<QueryOp> {
        self.ops
    }

    /// Append one operation.
    pub fn then(&self, op: QueryOp) -> Self {
        let mut next = self.clone();
        next.ops.push(op);
        next
    }

    /// Append several operations.
    pub fn extend(&self, ops: impl IntoIterator<Item = QueryOp>) -> Self {
        let mut next = self.clone();
        next.ops.extend(ops);
        next
    }

    /// Same operations over a different root type.
    pub fn retarget(&self, root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ops: self.ops.clone(),
        }
    }

    pub fn filter(&self, predicate: Lambda) -> Self {
        self.then(QueryOp::Where(predicate))
    }

    pub fn select(&self, projection: Lambda) -> Self {
        self.then(QueryOp::Select(projection))
    }

    pub fn select_many(&self, projection: Lambda) -> Self {
        self.then(QueryOp::SelectMany(projection))
    }

    pub fn order_by(&self, key: Lambda) -> Self {
        self.then(QueryOp::OrderBy {
            key,
            descending: false,
        })
    }

    pub fn order_by_descending(&self, key: Lambda) -> Self {
        self.then(QueryOp::OrderBy {
            key,
            descending: true,
        })
    }

    pub fn then_by(&self, key: Lambda) -> Self {
        self.then(QueryOp::ThenBy {
            key,
            descending: false,
        })
    }

    pub fn then_by_descending(&self, key: Lambda) -> Self {
        self.then(QueryOp::ThenBy {
            key,
            descending: true,
        })
    }

    pub fn skip(&self, count: usize) -> Self {
        self.then(QueryOp::Skip(count))
    }

    pub fn take(&self, count: usize) -> Self {
        self.then(QueryOp::Take(count))
    }

    pub fn of_type(&self, entity: impl Into<String>) -> Self {
        self.then(QueryOp::OfType(entity.into()))
    }

    pub fn include(&self, path: Lambda) -> Self {
        self.then(QueryOp::Include(path))
    }

    pub fn then_include(&self, path: Lambda) -> Self {
        self.then(QueryOp::ThenInclude(path))
    }

    /// Replace every positional parameter with its value.
    pub fn bind_params(&self, params: &[Value]) -> Result<Self, Error> {
        let ops = self
            .ops
            .iter()
            .map(|op| {
                op.try_map_lambda(&mut |lambda| {
                    Ok(Lambda {
                        param: lambda.param.clone(),
                        body: Box::new(lambda.body.bind_params(params)?),
                    })
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            root: self.root.clone(),
            ops,
        })
    }

    /// Replace every `$principal` reference with the given value.
    pub fn bind_principal(&self, principal: &Value) -> Self {
        let ops = self
            .ops
            .iter()
            .map(|op| {
                op.try_map_lambda(&mut |lambda| {
                    Ok(Lambda {
                        param: lambda.param.clone(),
                        body: Box::new(lambda.body.bind_principal(principal)),
                    })
                })
            })
            .collect::<Result<Vec<_>, Error>>()
            .unwrap_or_else(|_| self.ops.clone());
        Self {
            root: self.root.clone(),
            ops,
        }
    }

    /// Whether the plan ends in entity rows (no projection).
    pub fn yields_entities(&self) -> bool {
        !self
            .ops
            .iter()
            .any(|op| matches!(op, QueryOp::Select(_) | QueryOp::SelectMany(_)))
    }

    /// Helper for rules: keep rows where `x.<field> == value`.
    pub fn filter_eq(&self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Lambda::new(
            "x",
            Expr::var("x").member(field).eq(Expr::lit(value)),
        ))
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for op in &self.ops {
            write!(f, ".{}", op)?;
        }
        Ok(())
    }
}

/// Rows returned by a query plus the pre-paging total, when paging was requested.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result rows.
    pub rows: Vec<Value>,
    /// Total number of matching rows before paging.
    pub total: Option<usize>,
}

impl QueryResult {
    /// Create a result without a total count.
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows, total: None }
    }

    /// Attach a total count.
    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    /// Number of rows returned.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_is(value: i32) -> Lambda {
        Lambda::new("x", Expr::var("x").member("OwnerId").eq(Expr::lit(value)))
    }

    #[test]
    fn test_builders_do_not_mutate_receiver() {
        let base = QueryPlan::new("Document");
        let filtered = base.filter(owner_is(2));
        assert!(base.ops().is_empty());
        assert_eq!(filtered.ops().len(), 1);
        assert_eq!(filtered.root(), "Document");
    }

    #[test]
    fn test_retarget_keeps_ops() {
        let plan = QueryPlan::new("Document").filter(owner_is(2)).take(5);
        let retargeted = plan.retarget("Asset");
        assert_eq!(retargeted.root(), "Asset");
        assert_eq!(retargeted.ops(), plan.ops());
    }

    #[test]
    fn test_bind_params_across_ops() {
        let plan = QueryPlan::new("Document")
            .filter(Lambda::new("x", Expr::var("x").member("Id").gt(Expr::param(0))))
            .order_by(Lambda::new("x", Expr::var("x").member("Id")));
        let bound = plan.bind_params(&[Value::Int32(5)]).unwrap();
        match &bound.ops()[0] {
            QueryOp::Where(l) => {
                assert_eq!(*l.body, Expr::var("x").member("Id").gt(Expr::lit(5)))
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_yields_entities() {
        let plan = QueryPlan::new("Document").filter(owner_is(1));
        assert!(plan.yields_entities());
        let projected = plan.select(Lambda::new("x", Expr::var("x").member("Title")));
        assert!(!projected.yields_entities());
    }

    #[test]
    fn test_display() {
        let plan = QueryPlan::new("Document").filter_eq("OwnerId", 2).take(3);
        assert_eq!(
            plan.to_string(),
            "Document.where(x => (x.OwnerId == 2)).take(3)"
        );
    }

    #[test]
    fn test_op_names() {
        let key = Lambda::new("x", Expr::var("x").member("Id"));
        let op = QueryOp::OrderBy {
            key,
            descending: true,
        };
        assert_eq!(op.name(), "orderByDescending");
    }
}
