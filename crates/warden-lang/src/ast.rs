//! Syntax tree produced by the parser.
//!
//! Nodes keep their source spans so the binder can report unknown members
//! and arity errors at the right place. Binding lowers this tree into the
//! span-free [`warden_proto::Expr`].

use warden_proto::{BinaryOp, UnaryOp, Value};

use crate::span::{Span, Spanned};

/// A parsed expression with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// The expression.
    pub kind: NodeKind,
    /// Source span of the whole expression.
    pub span: Span,
}

impl Node {
    /// Create a new node.
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Whether this node is a lambda.
    pub fn is_lambda(&self) -> bool {
        matches!(self.kind, NodeKind::Lambda { .. })
    }

    /// The trailing member name of a member path (`x.Owner.Name` → `Name`),
    /// or the identifier itself. Used for record shorthand fields.
    pub fn trailing_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Member { name, .. } => Some(&name.value),
            NodeKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Literal constant.
    Literal(Value),
    /// Positional parameter `@N`.
    Param(usize),
    /// `$principal`.
    Principal,
    /// Free identifier (lambda parameter or implicit member).
    Ident(String),
    /// `target.name`.
    Member {
        target: Box<Node>,
        name: Spanned<String>,
    },
    /// `target.Method<TypeArg>(args)`.
    Call {
        target: Box<Node>,
        method: Spanned<String>,
        type_arg: Option<Spanned<String>>,
        args: Vec<Node>,
    },
    /// `!e` or `-e`.
    Unary { op: UnaryOp, operand: Box<Node> },
    /// `left op right`.
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    /// `test ? then : otherwise`.
    Conditional {
        test: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    /// `param => body`.
    Lambda {
        param: Spanned<String>,
        body: Box<Node>,
    },
    /// `new { A = e, x.B }`.
    Record(Vec<RecordField>),
    /// `[a, b, c]`.
    List(Vec<Node>),
}

/// A field of a record construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordField {
    /// Field name (explicit or inferred from a member path).
    pub name: Spanned<String>,
    /// Field value.
    pub value: Node,
}
