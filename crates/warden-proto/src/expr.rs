//! Expression AST embedded in query plans.
//!
//! Expressions are tagged unions rather than host-language closures so that
//! the security layer can walk and rewrite them before execution.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::query::QueryOp;
use crate::value::Value;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// `a ?? b`: `a` unless it is null.
    Coalesce,
}

impl BinaryOp {
    /// Source symbol of this operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Coalesce => "??",
        }
    }

    /// Whether the operator always yields a boolean.
    pub fn is_predicate(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Sequence methods callable on navigation values and sub-sequences.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Where,
    Select,
    SelectMany,
    Any,
    All,
    Count,
    Contains,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Skip,
    Take,
    First,
    FirstOrDefault,
    ToList,
    OfType(String),
}

impl Method {
    /// Look up a method by its source name. `OfType` needs a type argument
    /// and is resolved separately by the parser.
    pub fn from_name(name: &str) -> Option<Method> {
        let method = match name {
            "Where" => Method::Where,
            "Select" => Method::Select,
            "SelectMany" => Method::SelectMany,
            "Any" => Method::Any,
            "All" => Method::All,
            "Count" => Method::Count,
            "Contains" => Method::Contains,
            "OrderBy" => Method::OrderBy,
            "OrderByDescending" => Method::OrderByDescending,
            "ThenBy" => Method::ThenBy,
            "ThenByDescending" => Method::ThenByDescending,
            "Skip" => Method::Skip,
            "Take" => Method::Take,
            "First" => Method::First,
            "FirstOrDefault" => Method::FirstOrDefault,
            "ToList" => Method::ToList,
            _ => return None,
        };
        Some(method)
    }

    /// Source name of this method.
    pub fn name(&self) -> &str {
        match self {
            Method::Where => "Where",
            Method::Select => "Select",
            Method::SelectMany => "SelectMany",
            Method::Any => "Any",
            Method::All => "All",
            Method::Count => "Count",
            Method::Contains => "Contains",
            Method::OrderBy => "OrderBy",
            Method::OrderByDescending => "OrderByDescending",
            Method::ThenBy => "ThenBy",
            Method::ThenByDescending => "ThenByDescending",
            Method::Skip => "Skip",
            Method::Take => "Take",
            Method::First => "First",
            Method::FirstOrDefault => "FirstOrDefault",
            Method::ToList => "ToList",
            Method::OfType(_) => "OfType",
        }
    }
}

/// A single-parameter lambda, e.g. `x => x.OwnerId == @0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    /// Parameter name.
    pub param: String,
    /// Lambda body.
    pub body: Box<Expr>,
}

impl Lambda {
    /// Create a new lambda.
    pub fn new(param: impl Into<String>, body: Expr) -> Self {
        Self {
            param: param.into(),
            body: Box::new(body),
        }
    }

    /// Lambda that ignores its argument and yields a constant.
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::new("_", Expr::Literal(value.into()))
    }
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Positional parameter `@N`, bound before execution.
    Param(usize),
    /// The principal the query runs as, bound when a rule is instantiated.
    Principal,
    /// Reference to a lambda parameter.
    Var(String),
    /// Property access (scalar or navigation).
    Member { target: Box<Expr>, name: String },
    /// Unary operation.
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// Binary operation.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `test ? then : otherwise`.
    Conditional {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Sequence method call on `target`.
    Call {
        target: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
    /// Lambda argument of a sequence method.
    Lambda(Lambda),
    /// Record construction: `new { A = x.A, B = x.B }`.
    Record(Vec<(String, Expr)>),
    /// List literal.
    List(Vec<Expr>),
    /// A navigation access followed by its target type's select-rule
    /// operations. Produced by filter injection only.
    Secured {
        source: Box<Expr>,
        entity: String,
        ops: Vec<QueryOp>,
    },
}

impl Expr {
    /// Literal constant.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Lambda parameter reference.
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    /// Positional parameter.
    pub fn param(index: usize) -> Self {
        Expr::Param(index)
    }

    /// Property access on this expression.
    pub fn member(self, name: impl Into<String>) -> Self {
        Expr::Member {
            target: Box::new(self),
            name: name.into(),
        }
    }

    /// Sequence method call on this expression.
    pub fn call(self, method: Method, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: Box::new(self),
            method,
            args,
        }
    }

    /// Binary operation.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Eq, self, other)
    }

    pub fn ne(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Ne, self, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Lt, self, other)
    }

    pub fn gt(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Gt, self, other)
    }

    pub fn and(self, other: Expr) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    pub fn or(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Or, self, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }

    /// Combine predicates with `&&`; an empty list is `true`.
    pub fn all(predicates: impl IntoIterator<Item = Expr>) -> Self {
        predicates
            .into_iter()
            .reduce(Expr::and)
            .unwrap_or(Expr::Literal(Value::Bool(true)))
    }

    /// Combine predicates with `||`; an empty list is `false`.
    pub fn any(predicates: impl IntoIterator<Item = Expr>) -> Self {
        predicates
            .into_iter()
            .reduce(Expr::or)
            .unwrap_or(Expr::Literal(Value::Bool(false)))
    }

    /// Replace every `@N` with the N-th value.
    pub fn bind_params(&self, params: &[Value]) -> Result<Expr, Error> {
        self.try_map_leaves(&mut |leaf| match leaf {
            Expr::Param(index) => params
                .get(*index)
                .cloned()
                .map(|value| Some(Expr::Literal(value)))
                .ok_or(Error::UnboundParameter(*index)),
            _ => Ok(None),
        })
    }

    /// Replace every `$principal` with the given value.
    pub fn bind_principal(&self, principal: &Value) -> Expr {
        let bound: Result<Expr, Error> = self.try_map_leaves(&mut |leaf| match leaf {
            Expr::Principal => Ok(Some(Expr::Literal(principal.clone()))),
            _ => Ok(None),
        });
        bound.unwrap_or_else(|_| self.clone())
    }

    /// Highest positional parameter index referenced, if any.
    pub fn max_param(&self) -> Option<usize> {
        let mut max = None;
        self.walk(&mut |expr| {
            if let Expr::Param(index) = expr {
                max = Some(max.map_or(*index, |m: usize| m.max(*index)));
            }
        });
        max
    }

    /// Visit every node in pre-order.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Literal(_) | Expr::Param(_) | Expr::Principal | Expr::Var(_) => {}
            Expr::Member { target, .. } => target.walk(visit),
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                test.walk(visit);
                then.walk(visit);
                otherwise.walk(visit);
            }
            Expr::Call { target, args, .. } => {
                target.walk(visit);
                for arg in args {
                    arg.walk(visit);
                }
            }
            Expr::Lambda(lambda) => lambda.body.walk(visit),
            Expr::Record(fields) => {
                for (_, value) in fields {
                    value.walk(visit);
                }
            }
            Expr::List(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            Expr::Secured { source, ops, .. } => {
                source.walk(visit);
                for op in ops {
                    if let Some(lambda) = op.lambda() {
                        lambda.body.walk(visit);
                    }
                }
            }
        }
    }

    /// Rebuild the tree, replacing leaves for which `f` returns a new node.
    fn try_map_leaves(
        &self,
        f: &mut dyn FnMut(&Expr) -> Result<Option<Expr>, Error>,
    ) -> Result<Expr, Error> {
        if let Some(replaced) = f(self)? {
            return Ok(replaced);
        }
        let mapped = match self {
            Expr::Literal(_) | Expr::Param(_) | Expr::Principal | Expr::Var(_) => self.clone(),
            Expr::Member { target, name } => Expr::Member {
                target: Box::new(target.try_map_leaves(f)?),
                name: name.clone(),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.try_map_leaves(f)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.try_map_leaves(f)?),
                right: Box::new(right.try_map_leaves(f)?),
            },
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => Expr::Conditional {
                test: Box::new(test.try_map_leaves(f)?),
                then: Box::new(then.try_map_leaves(f)?),
                otherwise: Box::new(otherwise.try_map_leaves(f)?),
            },
            Expr::Call {
                target,
                method,
                args,
            } => Expr::Call {
                target: Box::new(target.try_map_leaves(f)?),
                method: method.clone(),
                args: args
                    .iter()
                    .map(|arg| arg.try_map_leaves(f))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Lambda(lambda) => Expr::Lambda(Lambda {
                param: lambda.param.clone(),
                body: Box::new(lambda.body.try_map_leaves(f)?),
            }),
            Expr::Record(fields) => Expr::Record(
                fields
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), value.try_map_leaves(f)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Expr::List(items) => Expr::List(
                items
                    .iter()
                    .map(|item| item.try_map_leaves(f))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Secured {
                source,
                entity,
                ops,
            } => Expr::Secured {
                source: Box::new(source.try_map_leaves(f)?),
                entity: entity.clone(),
                ops: ops
                    .iter()
                    .map(|op| {
                        op.try_map_lambda(&mut |lambda| {
                            Ok(Lambda {
                                param: lambda.param.clone(),
                                body: Box::new(lambda.body.try_map_leaves(f)?),
                            })
                        })
                    })
                    .collect::<Result<_, _>>()?,
            },
        };
        Ok(mapped)
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.param, self.body)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Param(index) => write!(f, "@{}", index),
            Expr::Principal => f.write_str("$principal"),
            Expr::Var(name) => f.write_str(name),
            Expr::Member { target, name } => write!(f, "{}.{}", target, name),
            Expr::Unary { op: UnaryOp::Not, operand } => write!(f, "!({})", operand),
            Expr::Unary { op: UnaryOp::Neg, operand } => write!(f, "-({})", operand),
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => write!(f, "({} ? {} : {})", test, then, otherwise),
            Expr::Call {
                target,
                method,
                args,
            } => {
                write!(f, "{}.{}", target, method.name())?;
                if let Method::OfType(ty) = method {
                    write!(f, "<{}>", ty)?;
                }
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Lambda(lambda) => write!(f, "{}", lambda),
            Expr::Record(fields) => {
                f.write_str("new { ")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {}", name, value)?;
                }
                f.write_str(" }")
            }
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Expr::Secured {
                source,
                entity,
                ops,
            } => {
                write!(f, "secure<{}>({}", entity, source)?;
                for op in ops {
                    write!(f, ".{}", op)?;
                }
                f.write_str(")")
            }
        }
    }
}
