//! Include paths and the include tree.
//!
//! An include lambda is a chain of navigation accesses from its parameter,
//! optionally followed by sequence operators (a filtered include):
//!
//! ```text
//! x => x.Parent.Children.Where(c => c.Archived == false).Take(5)
//! ```
//!
//! After filter injection every hop carries a guard: the target type's
//! select-rule operations, recorded as an [`Expr::Secured`] wrapper.

use warden_proto::{Expr, Lambda, Method, QueryOp, Value};

use crate::catalog::{Catalog, NavigationDef};
use crate::security::{SecurityError, SecurityResult};

/// Select-rule operations attached to one navigation hop.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    /// Target entity type the rule belongs to.
    pub entity: String,
    /// Rule operations applied to the loaded rows.
    pub ops: Vec<QueryOp>,
}

/// One navigation step of an include path.
#[derive(Debug, Clone, PartialEq)]
pub struct IncludeHop {
    pub name: String,
    pub guard: Option<Guard>,
}

/// A parsed include lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct IncludePath {
    /// Navigation hops from the lambda parameter.
    pub hops: Vec<IncludeHop>,
    /// Caller operators applied to the last hop.
    pub filters: Vec<QueryOp>,
}

impl IncludePath {
    /// Parse an include lambda. Anything but a navigation chain followed by
    /// filtering operators is rejected.
    pub fn parse(lambda: &Lambda) -> SecurityResult<Self> {
        let mut filters = Vec::new();
        let mut current = lambda.body.as_ref();
        while let Expr::Call {
            target,
            method,
            args,
        } = current
        {
            filters.push(filter_op(method, args)?);
            current = target;
        }
        filters.reverse();

        let hops = parse_hops(current, &lambda.param)?;
        if hops.is_empty() {
            return Err(SecurityError::UnsupportedShape(format!(
                "include path '{}' names no navigation",
                lambda
            )));
        }
        Ok(Self { hops, filters })
    }

    /// Dotted key of the first `len` hops, prefixed by `base`.
    pub fn key(&self, base: &str, len: usize) -> String {
        let mut key = base.to_string();
        for hop in &self.hops[..len] {
            if !key.is_empty() {
                key.push('.');
            }
            key.push_str(&hop.name);
        }
        key
    }

    /// Rebuild the lambda, with guards as `Secured` wrappers.
    pub fn into_lambda(self, param: &str) -> SecurityResult<Lambda> {
        let mut body = Expr::var(param);
        for hop in self.hops {
            body = body.member(hop.name);
            if let Some(guard) = hop.guard {
                body = Expr::Secured {
                    source: Box::new(body),
                    entity: guard.entity,
                    ops: guard.ops,
                };
            }
        }
        for op in self.filters {
            body = filter_call(body, op)?;
        }
        Ok(Lambda::new(param, body))
    }
}

fn parse_hops(expr: &Expr, param: &str) -> SecurityResult<Vec<IncludeHop>> {
    match expr {
        Expr::Var(name) if name == param => Ok(Vec::new()),
        Expr::Member { target, name } => {
            let mut hops = parse_hops(target, param)?;
            hops.push(IncludeHop {
                name: name.clone(),
                guard: None,
            });
            Ok(hops)
        }
        Expr::Secured {
            source,
            entity,
            ops,
        } if matches!(source.as_ref(), Expr::Member { .. }) => {
            let mut hops = parse_hops(source, param)?;
            if let Some(last) = hops.last_mut() {
                last.guard = Some(Guard {
                    entity: entity.clone(),
                    ops: ops.clone(),
                });
            }
            Ok(hops)
        }
        other => Err(SecurityError::UnsupportedShape(format!(
            "'{}' is not a navigation path",
            other
        ))),
    }
}

fn filter_op(method: &Method, args: &[Expr]) -> SecurityResult<QueryOp> {
    let lambda_arg = || match args {
        [Expr::Lambda(lambda)] => Ok(lambda.clone()),
        _ => Err(SecurityError::UnsupportedShape(format!(
            "include filter '{}' needs one lambda argument",
            method.name()
        ))),
    };
    let count_arg = || match args {
        [Expr::Literal(value)] => value
            .as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                SecurityError::UnsupportedShape(format!(
                    "include filter '{}' needs a non-negative count",
                    method.name()
                ))
            }),
        _ => Err(SecurityError::UnsupportedShape(format!(
            "include filter '{}' needs a constant count",
            method.name()
        ))),
    };

    let op = match method {
        Method::Where => QueryOp::Where(lambda_arg()?),
        Method::OrderBy | Method::OrderByDescending => QueryOp::OrderBy {
            key: lambda_arg()?,
            descending: *method == Method::OrderByDescending,
        },
        Method::ThenBy | Method::ThenByDescending => QueryOp::ThenBy {
            key: lambda_arg()?,
            descending: *method == Method::ThenByDescending,
        },
        Method::Skip => QueryOp::Skip(count_arg()?),
        Method::Take => QueryOp::Take(count_arg()?),
        Method::OfType(entity) if args.is_empty() => QueryOp::OfType(entity.clone()),
        other => {
            return Err(SecurityError::UnsupportedShape(format!(
                "'{}' cannot be used in an include path",
                other.name()
            )))
        }
    };
    Ok(op)
}

fn filter_call(target: Expr, op: QueryOp) -> SecurityResult<Expr> {
    let (method, args) = match op {
        QueryOp::Where(lambda) => (Method::Where, vec![Expr::Lambda(lambda)]),
        QueryOp::OrderBy { key, descending } => (
            if descending {
                Method::OrderByDescending
            } else {
                Method::OrderBy
            },
            vec![Expr::Lambda(key)],
        ),
        QueryOp::ThenBy { key, descending } => (
            if descending {
                Method::ThenByDescending
            } else {
                Method::ThenBy
            },
            vec![Expr::Lambda(key)],
        ),
        QueryOp::Skip(n) => (Method::Skip, vec![Expr::lit(count_literal(n))]),
        QueryOp::Take(n) => (Method::Take, vec![Expr::lit(count_literal(n))]),
        QueryOp::OfType(entity) => (Method::OfType(entity), Vec::new()),
        other => {
            return Err(SecurityError::UnsupportedShape(format!(
                "'{}' cannot be used in an include path",
                other.name()
            )))
        }
    };
    Ok(target.call(method, args))
}

fn count_literal(n: usize) -> Value {
    match i32::try_from(n) {
        Ok(small) => Value::Int32(small),
        Err(_) => Value::Int64(n as i64),
    }
}

/// One loaded navigation in the include tree.
#[derive(Debug, Clone)]
pub struct IncludeNode {
    pub name: String,
    pub navigation: NavigationDef,
    /// Guard operations followed by the caller's filters.
    pub ops: Vec<QueryOp>,
    pub children: Vec<IncludeNode>,
}

impl IncludeNode {
    fn child_mut(&mut self, path: &[usize]) -> &mut IncludeNode {
        match path.split_first() {
            Some((first, rest)) => self.children[*first].child_mut(rest),
            None => self,
        }
    }
}

/// Navigations to eager-load for each result row, merged by path.
#[derive(Debug, Clone, Default)]
pub struct IncludeTree {
    pub roots: Vec<IncludeNode>,
}

impl IncludeTree {
    /// Build the tree from the include operations of a secured plan.
    ///
    /// The first lambda seen for a path wins; later lambdas for the same path
    /// only move the `ThenInclude` cursor. A hop that creates a new node must
    /// carry a guard.
    pub fn build(
        catalog: &Catalog,
        root: &str,
        ops: &[QueryOp],
        max_depth: usize,
    ) -> SecurityResult<Self> {
        let mut tree = IncludeTree::default();
        let mut element = Some(root.to_string());
        // (path into the tree, entity at the end of it)
        let mut cursor: Option<(Vec<usize>, String)> = None;

        for op in ops {
            match op {
                QueryOp::OfType(entity) => element = Some(entity.clone()),
                QueryOp::Select(_) | QueryOp::SelectMany(_) => element = None,
                QueryOp::Include(lambda) => {
                    let Some(entity) = element.clone() else {
                        return Err(SecurityError::UnsupportedShape(
                            "include after a projection".to_string(),
                        ));
                    };
                    let path = IncludePath::parse(lambda)?;
                    cursor = Some(tree.merge(catalog, Vec::new(), entity, path, max_depth)?);
                }
                QueryOp::ThenInclude(lambda) => {
                    if element.is_none() {
                        return Err(SecurityError::UnsupportedShape(
                            "thenInclude after a projection".to_string(),
                        ));
                    }
                    let Some((at, entity)) = cursor.take() else {
                        return Err(SecurityError::UnsupportedShape(
                            "thenInclude without a preceding include".to_string(),
                        ));
                    };
                    let path = IncludePath::parse(lambda)?;
                    cursor = Some(tree.merge(catalog, at, entity, path, max_depth)?);
                }
                _ => {}
            }
        }
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn merge(
        &mut self,
        catalog: &Catalog,
        mut at: Vec<usize>,
        mut entity: String,
        path: IncludePath,
        max_depth: usize,
    ) -> SecurityResult<(Vec<usize>, String)> {
        let last = path.hops.len() - 1;
        let mut filters = Some(path.filters);

        for (i, hop) in path.hops.into_iter().enumerate() {
            let navigation = catalog.navigation(&entity, &hop.name).ok_or_else(|| {
                SecurityError::UnsupportedShape(format!(
                    "'{}' is not a navigation of '{}'",
                    hop.name, entity
                ))
            })?;
            if at.len() + 1 > max_depth {
                return Err(SecurityError::UnsupportedShape(format!(
                    "include path deeper than {} levels",
                    max_depth
                )));
            }

            let siblings = match at.split_first() {
                None => &mut self.roots,
                Some((first, rest)) => &mut self.roots[*first].child_mut(rest).children,
            };
            let index = match siblings.iter().position(|n| n.name == hop.name) {
                Some(index) => index,
                None => {
                    let guard = hop.guard.ok_or_else(|| {
                        SecurityError::UnsupportedShape(format!(
                            "include of '{}.{}' is not secured",
                            entity, hop.name
                        ))
                    })?;
                    if guard.entity != navigation.target {
                        return Err(SecurityError::UnsupportedShape(format!(
                            "guard for '{}' secures '{}'",
                            hop.name, guard.entity
                        )));
                    }
                    let mut ops = guard.ops;
                    if i == last {
                        ops.extend(filters.take().unwrap_or_default());
                    }
                    siblings.push(IncludeNode {
                        name: hop.name,
                        navigation: navigation.clone(),
                        ops,
                        children: Vec::new(),
                    });
                    siblings.len() - 1
                }
            };
            at.push(index);
            entity = navigation.target.clone();
        }
        Ok((at, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityType, FieldDef, ScalarType};

    fn catalog() -> Catalog {
        Catalog::new(vec![
            EntityType::new("Folder")
                .with_key("Id", ScalarType::Int32)
                .with_field(FieldDef::optional("ParentId", ScalarType::Int32))
                .with_navigation(NavigationDef::collection("Children", "Folder", "ParentId"))
                .with_navigation(NavigationDef::reference("Parent", "Folder", "ParentId"))
                .with_navigation(NavigationDef::collection("Items", "Item", "FolderId")),
            EntityType::new("Item")
                .with_key("Id", ScalarType::Int32)
                .with_field(FieldDef::new("FolderId", ScalarType::Int32)),
        ])
        .unwrap()
    }

    fn guarded(name: &str, entity: &str) -> IncludeHop {
        IncludeHop {
            name: name.to_string(),
            guard: Some(Guard {
                entity: entity.to_string(),
                ops: vec![QueryOp::Where(Lambda::constant(true))],
            }),
        }
    }

    #[test]
    fn test_parse_filtered_path() {
        let lambda = Lambda::new(
            "x",
            Expr::var("x")
                .member("Parent")
                .member("Children")
                .call(
                    Method::Where,
                    vec![Expr::Lambda(Lambda::new(
                        "c",
                        Expr::var("c").member("Id").gt(Expr::lit(1)),
                    ))],
                )
                .call(Method::Take, vec![Expr::lit(2)]),
        );
        let path = IncludePath::parse(&lambda).unwrap();
        assert_eq!(path.hops.len(), 2);
        assert_eq!(path.key("", 2), "Parent.Children");
        assert_eq!(path.key("Items", 1), "Items.Parent");
        assert_eq!(path.filters.len(), 2);
        assert!(matches!(path.filters[0], QueryOp::Where(_)));
        assert_eq!(path.filters[1], QueryOp::Take(2));
    }

    #[test]
    fn test_parse_rejects_non_paths() {
        let projection = Lambda::new("x", Expr::var("x").member("Id").gt(Expr::lit(1)));
        assert!(matches!(
            IncludePath::parse(&projection),
            Err(SecurityError::UnsupportedShape(_))
        ));

        let select = Lambda::new(
            "x",
            Expr::var("x").member("Children").call(
                Method::Select,
                vec![Expr::Lambda(Lambda::new("c", Expr::var("c").member("Items")))],
            ),
        );
        assert!(IncludePath::parse(&select).is_err());

        let bare = Lambda::new("x", Expr::var("x"));
        assert!(IncludePath::parse(&bare).is_err());
    }

    #[test]
    fn test_guards_round_trip_through_lambda() {
        let path = IncludePath {
            hops: vec![guarded("Children", "Folder")],
            filters: vec![QueryOp::Skip(1)],
        };
        let lambda = path.clone().into_lambda("x").unwrap();
        assert_eq!(IncludePath::parse(&lambda).unwrap(), path);
    }

    #[test]
    fn test_tree_merges_repeated_paths() {
        let secured = |hops: Vec<IncludeHop>| IncludePath {
            hops,
            filters: Vec::new(),
        };
        let ops = vec![
            QueryOp::Include(secured(vec![guarded("Children", "Folder")]).into_lambda("x").unwrap()),
            QueryOp::ThenInclude(secured(vec![guarded("Items", "Item")]).into_lambda("x").unwrap()),
            // repeated path, left unguarded by the injector
            QueryOp::Include(Lambda::new("x", Expr::var("x").member("Children"))),
        ];
        let tree = IncludeTree::build(&catalog(), "Folder", &ops, 8).unwrap();
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].name, "Children");
        assert_eq!(tree.roots[0].children.len(), 1);
        assert_eq!(tree.roots[0].children[0].name, "Items");
        assert_eq!(tree.roots[0].ops.len(), 1);
    }

    #[test]
    fn test_tree_rejects_unsecured_new_path() {
        let ops = vec![QueryOp::Include(Lambda::new(
            "x",
            Expr::var("x").member("Items"),
        ))];
        let err = IncludeTree::build(&catalog(), "Folder", &ops, 8).unwrap_err();
        assert!(matches!(err, SecurityError::UnsupportedShape(_)));
    }

    #[test]
    fn test_tree_rejects_include_after_select() {
        let ops = vec![
            QueryOp::Select(Lambda::new("x", Expr::var("x").member("Parent"))),
            QueryOp::Include(
                IncludePath {
                    hops: vec![guarded("Items", "Item")],
                    filters: Vec::new(),
                }
                .into_lambda("x").unwrap(),
            ),
        ];
        assert!(IncludeTree::build(&catalog(), "Folder", &ops, 8).is_err());
    }

    #[test]
    fn test_tree_depth_limit() {
        let path = IncludePath {
            hops: vec![guarded("Parent", "Folder"), guarded("Parent", "Folder")],
            filters: Vec::new(),
        };
        let ops = vec![QueryOp::Include(path.into_lambda("x").unwrap())];
        assert!(IncludeTree::build(&catalog(), "Folder", &ops, 1).is_err());
        assert!(IncludeTree::build(&catalog(), "Folder", &ops, 2).is_ok());
    }
}
