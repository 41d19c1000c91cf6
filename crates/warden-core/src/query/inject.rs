//! Filter injection.
//!
//! [`FilterInjector::secure`] turns a caller's plan into one where the root
//! rows and every navigation reachable from a lambda are filtered by their
//! target type's select rule:
//!
//! - the root type's select rule is applied first, and its operations are
//!   never revisited;
//! - each navigation access in a `Where`, `OrderBy`, `ThenBy`, `Select` or
//!   `SelectMany` lambda becomes an [`Expr::Secured`] node carrying the
//!   target's rule operations;
//! - each include hop gets a guard, once per include path; a repeated path
//!   is emitted without one and merged into the first by the executor;
//! - reads of properties ignored with [`IgnoreCondition::Always`] become a
//!   typed default and nothing navigates past them.
//!
//! Rewriting changes static shapes (a stored collection becomes a filtered
//! sequence), so every sequence call is re-resolved through
//! [`resolve_call`], and record fields holding a filtered sequence are
//! materialized with `ToList`.
//!
//! [`IgnoreCondition::Always`]: crate::security::IgnoreCondition::Always

use std::collections::{HashMap, HashSet};

use tracing::debug;
use warden_proto::{BinaryOp, Expr, Lambda, Method, QueryOp, QueryPlan, Value};

use super::include::{Guard, IncludePath};
use super::shape::{resolve_call, Shape};
use crate::catalog::{Catalog, Member, NavigationDef};
use crate::security::{Operation, Principal, RuleRegistry, SecurityError, SecurityResult};

/// A plan with security rules injected.
#[derive(Debug, Clone)]
pub struct SecuredPlan {
    /// The executable plan.
    pub plan: QueryPlan,
    /// Number of navigation sites that received a rule.
    pub secured_sites: usize,
    /// Include paths that were secured, in visit order.
    pub include_paths: Vec<String>,
}

/// Injects select rules into query plans for one principal.
pub struct FilterInjector<'a> {
    catalog: &'a Catalog,
    registry: &'a RuleRegistry,
    principal: &'a Principal,
}

impl<'a> FilterInjector<'a> {
    pub fn new(registry: &'a RuleRegistry, principal: &'a Principal) -> Self {
        Self {
            catalog: registry.catalog(),
            registry,
            principal,
        }
    }

    /// Secure a plan. Fails closed: a reachable type without a select rule
    /// aborts the whole build.
    pub fn secure(&self, plan: &QueryPlan) -> SecurityResult<SecuredPlan> {
        let root = plan.root();
        self.catalog.get(root)?;

        let mut build = Build {
            catalog: self.catalog,
            registry: self.registry,
            principal: self.principal,
            visited: HashSet::new(),
            include_paths: Vec::new(),
            sites: 0,
            guards: HashMap::new(),
        };

        let base = build.guard_ops(root)?;
        let mut element = Shape::Entity(root.to_string());
        for op in &base {
            if let QueryOp::OfType(entity) = op {
                element = Shape::Entity(entity.clone());
            }
        }
        let mut ops = base;
        let mut projected = false;
        // (path key, entity) at the end of the last include
        let mut cursor: Option<(String, String)> = None;

        let user = plan.bind_principal(self.principal.value());
        for op in user.ops() {
            let secured = match op {
                QueryOp::Where(predicate) => {
                    QueryOp::Where(build.rewrite_lambda(predicate, element.clone())?.0)
                }
                QueryOp::OrderBy { key, descending } => QueryOp::OrderBy {
                    key: build.rewrite_lambda(key, element.clone())?.0,
                    descending: *descending,
                },
                QueryOp::ThenBy { key, descending } => QueryOp::ThenBy {
                    key: build.rewrite_lambda(key, element.clone())?.0,
                    descending: *descending,
                },
                QueryOp::Select(projection) => {
                    let (lambda, shape) = build.rewrite_lambda(projection, element.clone())?;
                    element = shape;
                    projected = true;
                    QueryOp::Select(lambda)
                }
                QueryOp::SelectMany(projection) => {
                    let (lambda, shape) = build.rewrite_lambda(projection, element.clone())?;
                    element = shape.element().ok_or_else(|| {
                        SecurityError::UnsupportedShape(format!(
                            "selectMany projection must be a sequence, found {:?}",
                            shape
                        ))
                    })?;
                    projected = true;
                    QueryOp::SelectMany(lambda)
                }
                QueryOp::Skip(n) => QueryOp::Skip(*n),
                QueryOp::Take(n) => QueryOp::Take(*n),
                QueryOp::OfType(entity) => {
                    if !matches!(element, Shape::Entity(_)) || !self.catalog.contains(entity) {
                        return Err(SecurityError::UnsupportedShape(format!(
                            "ofType({}) on {:?}",
                            entity, element
                        )));
                    }
                    element = Shape::Entity(entity.clone());
                    QueryOp::OfType(entity.clone())
                }
                QueryOp::Include(path) => {
                    let entity = include_target(&element, projected, "include")?;
                    let (lambda, end) = build.secure_include(path, "", &entity)?;
                    cursor = Some(end);
                    QueryOp::Include(lambda)
                }
                QueryOp::ThenInclude(path) => {
                    include_target(&element, projected, "thenInclude")?;
                    let Some((key, entity)) = cursor.take() else {
                        return Err(SecurityError::UnsupportedShape(
                            "thenInclude without a preceding include".to_string(),
                        ));
                    };
                    let (lambda, end) = build.secure_include(path, &key, &entity)?;
                    cursor = Some(end);
                    QueryOp::ThenInclude(lambda)
                }
            };
            ops.push(secured);
        }

        let plan = QueryPlan::from_ops(root, ops).bind_principal(self.principal.value());
        debug!(
            root,
            secured_sites = build.sites,
            include_paths = ?build.include_paths,
            "secured query plan"
        );
        Ok(SecuredPlan {
            plan,
            secured_sites: build.sites,
            include_paths: build.include_paths,
        })
    }
}

fn include_target(element: &Shape, projected: bool, op: &str) -> SecurityResult<String> {
    match element {
        Shape::Entity(entity) if !projected => Ok(entity.clone()),
        _ => Err(SecurityError::UnsupportedShape(format!(
            "{} after a projection",
            op
        ))),
    }
}

/// A rewritten sub-expression.
struct Rewritten {
    expr: Expr,
    shape: Shape,
    /// The expression stands in for an ignored property; nothing may
    /// navigate past it.
    forbidden: bool,
}

impl Rewritten {
    fn plain(expr: Expr, shape: Shape) -> Self {
        Self {
            expr,
            shape,
            forbidden: false,
        }
    }
}

/// State of one `secure` call.
struct Build<'a> {
    catalog: &'a Catalog,
    registry: &'a RuleRegistry,
    principal: &'a Principal,
    /// Include path keys already secured in this build.
    visited: HashSet<String>,
    include_paths: Vec<String>,
    sites: usize,
    /// Select-rule operations per target type.
    guards: HashMap<String, Vec<QueryOp>>,
}

impl<'a> Build<'a> {
    /// Operations of `entity`'s select rule, applied to an empty plan.
    fn guard_ops(&mut self, entity: &str) -> SecurityResult<Vec<QueryOp>> {
        if let Some(ops) = self.guards.get(entity) {
            return Ok(ops.clone());
        }
        let rule = self.registry.resolve(entity, Operation::Select)?;
        let ops = rule.base_plan(entity, self.principal)?.into_ops();
        for op in &ops {
            if !matches!(
                op,
                QueryOp::Where(_)
                    | QueryOp::OfType(_)
                    | QueryOp::OrderBy { .. }
                    | QueryOp::ThenBy { .. }
                    | QueryOp::Skip(_)
                    | QueryOp::Take(_)
            ) {
                return Err(SecurityError::UnsupportedShape(format!(
                    "select rule '{}' of '{}' produces '{}', which cannot filter rows",
                    rule.name(),
                    entity,
                    op.name()
                )));
            }
        }
        self.guards.insert(entity.to_string(), ops.clone());
        Ok(ops)
    }

    /// Whether reads of `name` on `entity`-typed values must be hidden.
    /// A flag on any subtype hides the property for the whole static type.
    fn hidden(&self, entity: &str, name: &str) -> bool {
        self.catalog
            .subtypes(entity)
            .into_iter()
            .any(|ty| self.registry.property_flags(ty).is_hidden(name))
    }

    fn rewrite_lambda(&mut self, lambda: &Lambda, param: Shape) -> SecurityResult<(Lambda, Shape)> {
        let mut scope = vec![(lambda.param.clone(), param)];
        let body = self.rewrite(&lambda.body, &mut scope)?;
        Ok((Lambda::new(lambda.param.clone(), body.expr), body.shape))
    }

    fn secure_include(
        &mut self,
        lambda: &Lambda,
        base: &str,
        entity: &str,
    ) -> SecurityResult<(Lambda, (String, String))> {
        let mut path = IncludePath::parse(lambda)?;
        let mut current = entity.to_string();

        for i in 0..path.hops.len() {
            let key = path.key(base, i + 1);
            let name = path.hops[i].name.clone();
            let navigation = self.catalog.navigation(&current, &name).cloned().ok_or_else(|| {
                SecurityError::UnsupportedShape(format!(
                    "'{}' is not a navigation of '{}'",
                    name, current
                ))
            })?;
            if self.hidden(&current, &name) {
                return Err(SecurityError::UnsupportedShape(format!(
                    "'{}.{}' is ignored and cannot be included",
                    current, name
                )));
            }

            path.hops[i].guard = if self.visited.insert(key.clone()) {
                self.include_paths.push(key);
                self.sites += 1;
                Some(Guard {
                    entity: navigation.target.clone(),
                    ops: self.guard_ops(&navigation.target)?,
                })
            } else {
                None
            };
            current = navigation.target;
        }

        let element = Shape::Entity(current.clone());
        let filters = std::mem::take(&mut path.filters);
        for filter in filters {
            let filter = match filter {
                QueryOp::Where(predicate) => {
                    QueryOp::Where(self.rewrite_lambda(&predicate, element.clone())?.0)
                }
                QueryOp::OrderBy { key, descending } => QueryOp::OrderBy {
                    key: self.rewrite_lambda(&key, element.clone())?.0,
                    descending,
                },
                QueryOp::ThenBy { key, descending } => QueryOp::ThenBy {
                    key: self.rewrite_lambda(&key, element.clone())?.0,
                    descending,
                },
                other => other,
            };
            path.filters.push(filter);
        }

        let end = (path.key(base, path.hops.len()), current);
        Ok((path.into_lambda(&lambda.param)?, end))
    }

    fn rewrite(&mut self, expr: &Expr, scope: &mut Vec<(String, Shape)>) -> SecurityResult<Rewritten> {
        match expr {
            Expr::Literal(value) => {
                let shape = match value {
                    Value::List(_) => Shape::Values,
                    _ => Shape::Scalar,
                };
                Ok(Rewritten::plain(expr.clone(), shape))
            }
            Expr::Param(_) | Expr::Principal => Ok(Rewritten::plain(expr.clone(), Shape::Scalar)),
            Expr::Var(name) => {
                let shape = scope
                    .iter()
                    .rev()
                    .find(|(param, _)| param == name)
                    .map(|(_, shape)| shape.clone())
                    .ok_or_else(|| {
                        SecurityError::UnsupportedShape(format!("unbound variable '{}'", name))
                    })?;
                Ok(Rewritten::plain(expr.clone(), shape))
            }
            Expr::Member { target, name } => {
                let target = self.rewrite(target, scope)?;
                self.member(target, name)
            }
            Expr::Unary { op, operand } => {
                let operand = self.rewrite(operand, scope)?;
                Ok(Rewritten::plain(
                    Expr::Unary {
                        op: *op,
                        operand: Box::new(operand.expr),
                    },
                    Shape::Scalar,
                ))
            }
            Expr::Binary { op, left, right } => {
                let left = self.rewrite(left, scope)?;
                let right = self.rewrite(right, scope)?;
                let shape = match op {
                    BinaryOp::Coalesce => left.shape.clone(),
                    _ => Shape::Scalar,
                };
                Ok(Rewritten::plain(
                    Expr::binary(*op, left.expr, right.expr),
                    shape,
                ))
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                let test = self.rewrite(test, scope)?;
                let then = self.rewrite(then, scope)?;
                let otherwise = self.rewrite(otherwise, scope)?;
                Ok(Rewritten::plain(
                    Expr::Conditional {
                        test: Box::new(test.expr),
                        then: Box::new(then.expr),
                        otherwise: Box::new(otherwise.expr),
                    },
                    then.shape,
                ))
            }
            Expr::Call {
                target,
                method,
                args,
            } => self.call(target, method, args, scope),
            Expr::Lambda(lambda) => Err(SecurityError::UnsupportedShape(format!(
                "lambda '{}' outside a method call",
                lambda
            ))),
            Expr::Record(fields) => {
                let mut exprs = Vec::with_capacity(fields.len());
                let mut shapes = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    let value = self.rewrite(value, scope)?;
                    let (expr, shape) = match value.shape {
                        Shape::Sequence(entity) => (
                            value.expr.call(Method::ToList, Vec::new()),
                            Shape::Collection(entity),
                        ),
                        shape => (value.expr, shape),
                    };
                    exprs.push((name.clone(), expr));
                    shapes.push((name.clone(), shape));
                }
                Ok(Rewritten::plain(Expr::Record(exprs), Shape::Record(shapes)))
            }
            Expr::List(items) => {
                let items = items
                    .iter()
                    .map(|item| Ok(self.rewrite(item, scope)?.expr))
                    .collect::<SecurityResult<Vec<_>>>()?;
                Ok(Rewritten::plain(Expr::List(items), Shape::Values))
            }
            Expr::Secured { source, entity, .. } => {
                // Rebuilt from the registry; caller-supplied rule operations
                // are never trusted.
                let Expr::Member { target, name } = source.as_ref() else {
                    return Err(SecurityError::UnsupportedShape(format!(
                        "secured source '{}' is not a navigation",
                        source
                    )));
                };
                let target = self.rewrite(target, scope)?;
                let rewritten = self.member(target, name)?;
                let secures = matches!(
                    &rewritten.expr,
                    Expr::Secured { entity: target, .. } if target == entity
                );
                if secures || rewritten.forbidden {
                    Ok(rewritten)
                } else {
                    Err(SecurityError::UnsupportedShape(format!(
                        "'{}' does not navigate to '{}'",
                        source, entity
                    )))
                }
            }
        }
    }

    fn member(&mut self, target: Rewritten, name: &str) -> SecurityResult<Rewritten> {
        let entity = match &target.shape {
            Shape::Entity(entity) => entity.clone(),
            Shape::Record(_) if !target.forbidden => {
                let shape = target.shape.field(name);
                return Ok(Rewritten::plain(target.expr.member(name), shape));
            }
            _ if target.forbidden => {
                return Ok(Rewritten {
                    expr: Expr::Literal(Value::Null),
                    shape: Shape::Scalar,
                    forbidden: true,
                })
            }
            other => {
                return Err(SecurityError::UnsupportedShape(format!(
                    "member '{}' on {:?}",
                    name, other
                )))
            }
        };

        let member = self.catalog.member(&entity, name).ok_or_else(|| {
            SecurityError::UnsupportedShape(format!("'{}' has no member '{}'", entity, name))
        })?;
        if target.forbidden || self.hidden(&entity, name) {
            return Ok(hidden_member(member));
        }

        let access = target.expr.member(name);
        match member {
            Member::Field(_) => Ok(Rewritten::plain(access, Shape::Scalar)),
            Member::Navigation(navigation) => {
                let navigation = navigation.clone();
                self.secure_navigation(access, &navigation)
            }
        }
    }

    fn secure_navigation(
        &mut self,
        access: Expr,
        navigation: &NavigationDef,
    ) -> SecurityResult<Rewritten> {
        let ops = self.guard_ops(&navigation.target)?;
        self.sites += 1;
        let shape = if navigation.is_collection() {
            Shape::Sequence(navigation.target.clone())
        } else {
            Shape::Entity(navigation.target.clone())
        };
        Ok(Rewritten::plain(
            Expr::Secured {
                source: Box::new(access),
                entity: navigation.target.clone(),
                ops,
            },
            shape,
        ))
    }

    fn call(
        &mut self,
        target: &Expr,
        method: &Method,
        args: &[Expr],
        scope: &mut Vec<(String, Shape)>,
    ) -> SecurityResult<Rewritten> {
        let target = self.rewrite(target, scope)?;
        let element = target.shape.element();

        let mut rewritten_args = Vec::with_capacity(args.len());
        let mut projection = None;
        for arg in args {
            match arg {
                Expr::Lambda(lambda) => {
                    let param = element.clone().ok_or_else(|| {
                        SecurityError::UnsupportedShape(format!(
                            "'{}' on {:?}",
                            method.name(),
                            target.shape
                        ))
                    })?;
                    scope.push((lambda.param.clone(), param));
                    let body = self.rewrite(&lambda.body, scope);
                    scope.pop();
                    let body = body?;
                    if projection.is_none() {
                        projection = Some(body.shape);
                    }
                    rewritten_args.push(Expr::Lambda(Lambda::new(lambda.param.clone(), body.expr)));
                }
                other => rewritten_args.push(self.rewrite(other, scope)?.expr),
            }
        }

        if let Method::OfType(entity) = method {
            if !self.catalog.contains(entity) {
                return Err(SecurityError::UnsupportedShape(format!(
                    "ofType of unknown entity '{}'",
                    entity
                )));
            }
        }
        let shape = resolve_call(method, &target.shape, args.len(), projection.as_ref())?;
        Ok(Rewritten::plain(
            target.expr.call(method.clone(), rewritten_args),
            shape,
        ))
    }
}

/// Stand-in for a property that must not be observed.
fn hidden_member(member: Member<'_>) -> Rewritten {
    let (value, shape) = match member {
        Member::Field(field) => (field.typed_default(), Shape::Scalar),
        Member::Navigation(navigation) if navigation.is_collection() => (
            Value::List(Vec::new()),
            Shape::Collection(navigation.target.clone()),
        ),
        Member::Navigation(navigation) => (Value::Null, Shape::Entity(navigation.target.clone())),
    };
    Rewritten {
        expr: Expr::Literal(value),
        shape,
        forbidden: true,
    }
}
