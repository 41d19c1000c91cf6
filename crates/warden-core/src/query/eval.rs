//! Expression and operation evaluation over rows.
//!
//! Navigations are loaded lazily from a [`RowSource`] when a member access
//! reaches one. Security is not applied here: filtered navigations arrive as
//! [`Expr::Secured`] nodes from the injector and are evaluated like any
//! other operation list.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use warden_proto::{BinaryOp, Expr, Lambda, Method, QueryOp, UnaryOp, Value};

use crate::catalog::{Catalog, NavigationDef, NavigationKind};
use crate::error::Error;
use crate::security::{SecurityError, SecurityResult};
use crate::storage::{RowKey, RowSource};

/// Lambda parameter bindings, innermost first.
struct Env<'e> {
    name: &'e str,
    value: &'e Value,
    parent: Option<&'e Env<'e>>,
}

impl<'e> Env<'e> {
    fn lookup(&self, name: &str) -> Option<&'e Value> {
        if self.name == name {
            Some(self.value)
        } else {
            self.parent.and_then(|p| p.lookup(name))
        }
    }
}

fn evaluation(message: impl Into<String>) -> SecurityError {
    SecurityError::Storage(Error::Evaluation(message.into()))
}

/// Evaluates expressions and plan operations against a row source.
pub struct Evaluator<'a> {
    catalog: &'a Catalog,
    source: &'a dyn RowSource,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Evaluator<'a> {
    pub fn new(catalog: &'a Catalog, source: &'a dyn RowSource) -> Self {
        Self {
            catalog,
            source,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> SecurityResult<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(SecurityError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Evaluate a closed expression.
    pub fn eval(&self, expr: &Expr) -> SecurityResult<Value> {
        self.eval_in(expr, None)
    }

    /// Invoke a lambda on one argument.
    pub fn call(&self, lambda: &Lambda, arg: &Value) -> SecurityResult<Value> {
        self.invoke(lambda, arg, None)
    }

    fn invoke(&self, lambda: &Lambda, arg: &Value, env: Option<&Env<'_>>) -> SecurityResult<Value> {
        let scope = Env {
            name: &lambda.param,
            value: arg,
            parent: env,
        };
        self.eval_in(&lambda.body, Some(&scope))
    }

    /// Apply plan operations to rows. Include operations are skipped; the
    /// executor loads them after paging.
    pub fn apply_ops(&self, rows: Vec<Value>, ops: &[QueryOp]) -> SecurityResult<Vec<Value>> {
        self.apply_ops_in(rows, ops, None)
    }

    fn apply_ops_in(
        &self,
        mut rows: Vec<Value>,
        ops: &[QueryOp],
        env: Option<&Env<'_>>,
    ) -> SecurityResult<Vec<Value>> {
        // Keys of the current ordering, extended by ThenBy.
        let mut ordering: Vec<(&Lambda, bool)> = Vec::new();

        for op in ops {
            self.check_cancelled()?;
            match op {
                QueryOp::Where(predicate) => {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if self.invoke(predicate, &row, env)?.is_true() {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                QueryOp::Select(projection) => {
                    rows = rows
                        .iter()
                        .map(|row| self.invoke(projection, row, env))
                        .collect::<SecurityResult<_>>()?;
                }
                QueryOp::SelectMany(projection) => {
                    let mut flat = Vec::new();
                    for row in &rows {
                        flat.extend(sequence(self.invoke(projection, row, env)?)?);
                    }
                    rows = flat;
                }
                QueryOp::OrderBy { key, descending } => {
                    ordering = vec![(key, *descending)];
                    rows = self.sort(rows, &ordering, env)?;
                }
                QueryOp::ThenBy { key, descending } => {
                    if ordering.is_empty() {
                        return Err(evaluation("thenBy without a preceding orderBy"));
                    }
                    ordering.push((key, *descending));
                    rows = self.sort(rows, &ordering, env)?;
                }
                QueryOp::Skip(n) => {
                    rows = rows.into_iter().skip(*n).collect();
                }
                QueryOp::Take(n) => rows.truncate(*n),
                QueryOp::OfType(entity) => {
                    rows.retain(|row| {
                        row.entity_type()
                            .is_some_and(|ty| self.catalog.is_subtype(ty, entity))
                    });
                }
                QueryOp::Include(_) | QueryOp::ThenInclude(_) => {}
            }
            if !matches!(op, QueryOp::OrderBy { .. } | QueryOp::ThenBy { .. }) {
                ordering.clear();
            }
        }
        Ok(rows)
    }

    fn sort(
        &self,
        rows: Vec<Value>,
        ordering: &[(&Lambda, bool)],
        env: Option<&Env<'_>>,
    ) -> SecurityResult<Vec<Value>> {
        let mut keyed = rows
            .into_iter()
            .map(|row| -> SecurityResult<(Vec<Value>, Value)> {
                let keys = ordering
                    .iter()
                    .map(|(key, _)| self.invoke(key, &row, env))
                    .collect::<SecurityResult<Vec<_>>>()?;
                Ok((keys, row))
            })
            .collect::<SecurityResult<Vec<_>>>()?;

        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), (_, descending)) in a.iter().zip(b).zip(ordering) {
                let ord = x.compare(y).unwrap_or(Ordering::Equal);
                let ord = if *descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn eval_in(&self, expr: &Expr, env: Option<&Env<'_>>) -> SecurityResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Param(index) => Err(evaluation(format!("parameter @{} is not bound", index))),
            Expr::Principal => Err(evaluation("$principal is not bound")),
            Expr::Var(name) => env
                .and_then(|e| e.lookup(name))
                .cloned()
                .ok_or_else(|| evaluation(format!("unbound variable '{}'", name))),
            Expr::Member { target, name } => {
                let target = self.eval_in(target, env)?;
                self.member(&target, name)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval_in(operand, env)?;
                unary(*op, value)
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    if !self.eval_in(left, env)?.is_true() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.eval_in(right, env)?.is_true()))
                }
                BinaryOp::Or => {
                    if self.eval_in(left, env)?.is_true() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.eval_in(right, env)?.is_true()))
                }
                BinaryOp::Coalesce => {
                    let value = self.eval_in(left, env)?;
                    if value.is_null() {
                        self.eval_in(right, env)
                    } else {
                        Ok(value)
                    }
                }
                _ => {
                    let l = self.eval_in(left, env)?;
                    let r = self.eval_in(right, env)?;
                    binary(*op, &l, &r)
                }
            },
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                if self.eval_in(test, env)?.is_true() {
                    self.eval_in(then, env)
                } else {
                    self.eval_in(otherwise, env)
                }
            }
            Expr::Call {
                target,
                method,
                args,
            } => self.eval_call(target, method, args, env),
            Expr::Lambda(_) => Err(evaluation("lambda used as a value")),
            Expr::Record(fields) => {
                let mut map = BTreeMap::new();
                for (name, value) in fields {
                    map.insert(name.clone(), self.eval_in(value, env)?);
                }
                Ok(Value::Object(map))
            }
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval_in(item, env))
                    .collect::<SecurityResult<_>>()?,
            )),
            Expr::Secured { source, ops, .. } => match self.eval_in(source, env)? {
                Value::Null => Ok(Value::Null),
                Value::List(rows) => Ok(Value::List(self.apply_ops_in(rows, ops, env)?)),
                row => Ok(self
                    .apply_ops_in(vec![row], ops, env)?
                    .into_iter()
                    .next()
                    .unwrap_or(Value::Null)),
            },
        }
    }

    fn member(&self, target: &Value, name: &str) -> SecurityResult<Value> {
        let Value::Object(map) = target else {
            return match target {
                Value::Null => Ok(Value::Null),
                other => Err(evaluation(format!(
                    "cannot read '{}' from a {} value",
                    name,
                    other.kind()
                ))),
            };
        };
        if let Some(value) = map.get(name) {
            return Ok(value.clone());
        }
        match target
            .entity_type()
            .and_then(|ty| self.catalog.navigation(ty, name))
        {
            Some(navigation) => self.load_navigation(target, navigation),
            None => Ok(Value::Null),
        }
    }

    /// Load a navigation of an entity row: the referenced row (or null) or
    /// the list of owned rows.
    pub fn load_navigation(&self, row: &Value, navigation: &NavigationDef) -> SecurityResult<Value> {
        self.check_cancelled()?;
        let root = self
            .catalog
            .root_of(&navigation.target)
            .ok_or_else(|| Error::UnknownEntity(navigation.target.clone()))?;

        match &navigation.kind {
            NavigationKind::Reference { foreign_key } => {
                let fk = row.field(foreign_key).unwrap_or(&Value::Null);
                let Some(key) = RowKey::from_values([fk]) else {
                    return Ok(Value::Null);
                };
                let target = self.source.get(root, &key)?;
                Ok(target
                    .filter(|t| self.is_instance(t, &navigation.target))
                    .unwrap_or(Value::Null))
            }
            NavigationKind::Collection { inverse_key } => {
                let owner = row.entity_type().unwrap_or_default();
                let Some(owner_key) = self
                    .catalog
                    .single_key(owner)
                    .and_then(|key| row.field(&key.name))
                else {
                    return Ok(Value::List(Vec::new()));
                };
                let rows = self
                    .source
                    .scan(root)?
                    .into_iter()
                    .filter(|candidate| {
                        self.is_instance(candidate, &navigation.target)
                            && candidate
                                .field(inverse_key)
                                .is_some_and(|fk| fk.loose_eq(owner_key))
                    })
                    .collect();
                Ok(Value::List(rows))
            }
        }
    }

    /// Whether a row's runtime type is `entity` or one of its subtypes.
    pub fn is_instance(&self, row: &Value, entity: &str) -> bool {
        row.entity_type()
            .is_some_and(|ty| self.catalog.is_subtype(ty, entity))
    }

    fn eval_call(
        &self,
        target: &Expr,
        method: &Method,
        args: &[Expr],
        env: Option<&Env<'_>>,
    ) -> SecurityResult<Value> {
        if matches!(method, Method::ThenBy | Method::ThenByDescending) {
            return self.eval_ordering(target, method, args, env);
        }
        if let Some(op) = self.sequence_op(method, args, env)? {
            let rows = sequence(self.eval_in(target, env)?)?;
            return Ok(Value::List(self.apply_ops_in(rows, &[op], env)?));
        }

        let receiver = self.eval_in(target, env)?;
        let rows = sequence(receiver)?;
        let lambda = match args {
            [Expr::Lambda(lambda)] => Some(lambda),
            _ => None,
        };
        let matches = |row: &Value| -> SecurityResult<bool> {
            match lambda {
                Some(predicate) => Ok(self.invoke(predicate, row, env)?.is_true()),
                None => Ok(true),
            }
        };

        match method {
            Method::Any => {
                for row in &rows {
                    if matches(row)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Method::All => {
                for row in &rows {
                    if !matches(row)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Method::Count => {
                let mut count = 0i64;
                for row in &rows {
                    if matches(row)? {
                        count += 1;
                    }
                }
                Ok(match i32::try_from(count) {
                    Ok(small) => Value::Int32(small),
                    Err(_) => Value::Int64(count),
                })
            }
            Method::Contains => {
                let [needle] = args else {
                    return Err(evaluation("Contains expects one argument"));
                };
                let needle = self.eval_in(needle, env)?;
                Ok(Value::Bool(rows.iter().any(|row| row.loose_eq(&needle))))
            }
            Method::First | Method::FirstOrDefault => {
                for row in rows {
                    if matches(&row)? {
                        return Ok(row);
                    }
                }
                if *method == Method::First {
                    Err(evaluation("First on an empty sequence"))
                } else {
                    Ok(Value::Null)
                }
            }
            Method::ToList => Ok(Value::List(rows)),
            other => Err(evaluation(format!("cannot evaluate '{}'", other.name()))),
        }
    }

    /// Sequence-to-sequence calls expressed as a plan operation.
    fn sequence_op(
        &self,
        method: &Method,
        args: &[Expr],
        env: Option<&Env<'_>>,
    ) -> SecurityResult<Option<QueryOp>> {
        let lambda = || match args {
            [Expr::Lambda(lambda)] => Ok(lambda.clone()),
            _ => Err(evaluation(format!("'{}' expects a lambda", method.name()))),
        };
        let op = match method {
            Method::Where => QueryOp::Where(lambda()?),
            Method::Select => QueryOp::Select(lambda()?),
            Method::SelectMany => QueryOp::SelectMany(lambda()?),
            Method::OrderBy | Method::OrderByDescending => QueryOp::OrderBy {
                key: lambda()?,
                descending: *method == Method::OrderByDescending,
            },
            Method::Skip | Method::Take => {
                let [count] = args else {
                    return Err(evaluation(format!("'{}' expects a count", method.name())));
                };
                let count = self
                    .eval_in(count, env)?
                    .as_i64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| {
                        evaluation(format!("'{}' expects a non-negative count", method.name()))
                    })?;
                if *method == Method::Skip {
                    QueryOp::Skip(count)
                } else {
                    QueryOp::Take(count)
                }
            }
            Method::OfType(entity) => QueryOp::OfType(entity.clone()),
            _ => return Ok(None),
        };
        Ok(Some(op))
    }

    /// Evaluate `src.OrderBy(a).ThenBy(b)...` as one ordering.
    fn eval_ordering(
        &self,
        target: &Expr,
        method: &Method,
        args: &[Expr],
        env: Option<&Env<'_>>,
    ) -> SecurityResult<Value> {
        let mut chain = vec![(method, args)];
        let mut base = target;
        loop {
            match base {
                Expr::Call {
                    target,
                    method: inner @ (Method::ThenBy | Method::ThenByDescending),
                    args,
                } => {
                    chain.push((inner, args.as_slice()));
                    base = target;
                }
                Expr::Call {
                    target,
                    method: inner @ (Method::OrderBy | Method::OrderByDescending),
                    args,
                } => {
                    chain.push((inner, args.as_slice()));
                    base = target;
                    break;
                }
                _ => return Err(evaluation("ThenBy without a preceding OrderBy")),
            }
        }
        chain.reverse();

        let mut ops = Vec::with_capacity(chain.len());
        for (i, (method, args)) in chain.into_iter().enumerate() {
            let [Expr::Lambda(key)] = args else {
                return Err(evaluation(format!("'{}' expects a lambda", method.name())));
            };
            let descending = matches!(method, Method::OrderByDescending | Method::ThenByDescending);
            ops.push(if i == 0 {
                QueryOp::OrderBy {
                    key: key.clone(),
                    descending,
                }
            } else {
                QueryOp::ThenBy {
                    key: key.clone(),
                    descending,
                }
            });
        }
        let rows = sequence(self.eval_in(base, env)?)?;
        Ok(Value::List(self.apply_ops_in(rows, &ops, env)?))
    }
}

/// Rows of a sequence value; null is the empty sequence.
fn sequence(value: Value) -> SecurityResult<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(evaluation(format!("expected a sequence, got {}", other.kind()))),
    }
}

fn unary(op: UnaryOp, value: Value) -> SecurityResult<Value> {
    match (op, value) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int32(i)) => Ok(i
            .checked_neg()
            .map(Value::Int32)
            .unwrap_or(Value::Int64(-(i as i64)))),
        (UnaryOp::Neg, Value::Int64(i)) => i
            .checked_neg()
            .map(Value::Int64)
            .ok_or_else(|| evaluation("integer overflow")),
        (UnaryOp::Neg, Value::Float64(f)) => Ok(Value::Float64(-f)),
        (op, other) => Err(evaluation(format!(
            "cannot apply {:?} to a {} value",
            op,
            other.kind()
        ))),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> SecurityResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(l.loose_eq(r))),
        BinaryOp::Ne => Ok(Value::Bool(!l.loose_eq(r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Bool(false));
            }
            let result = l.compare(r).is_some_and(|ord| match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            });
            Ok(Value::Bool(result))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, l, r)
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => {
            Err(evaluation(format!("'{}' is evaluated lazily", op.symbol())))
        }
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> SecurityResult<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if op == BinaryOp::Add {
        if let (Value::String(a), Value::String(b)) = (l, r) {
            return Ok(Value::String(format!("{}{}", a, b)));
        }
    }

    match (l, r) {
        (Value::Int32(a), Value::Int32(b)) => match integer_op(op, *a as i64, *b as i64)? {
            n if i32::try_from(n).is_ok() => Ok(Value::Int32(n as i32)),
            n => Ok(Value::Int64(n)),
        },
        (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
            let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) else {
                return Err(evaluation("integer operand expected"));
            };
            Ok(Value::Int64(integer_op(op, a, b)?))
        }
        (a, b) if a.is_numeric() && b.is_numeric() => {
            let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                return Err(evaluation("numeric operand expected"));
            };
            let value = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            Ok(Value::Float64(value))
        }
        _ => Err(evaluation(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            l.kind(),
            r.kind()
        ))),
    }
}

fn integer_op(op: BinaryOp, a: i64, b: i64) -> SecurityResult<i64> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div | BinaryOp::Mod if b == 0 => {
            return Err(evaluation("division by zero"));
        }
        BinaryOp::Div => a.checked_div(b),
        _ => a.checked_rem(b),
    };
    result.ok_or_else(|| evaluation("integer overflow"))
}
