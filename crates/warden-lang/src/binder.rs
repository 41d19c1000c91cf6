//! Name binding: lowers a parsed [`Node`] into a proto [`Expr`], resolving
//! identifiers against lambda scopes and members against the schema.

use warden_proto::{Expr, Lambda, Method, ValueKind};

use crate::ast::{Node, NodeKind};
use crate::error::{CompileError, CompileErrorKind};
use crate::span::{Span, Spanned};

/// Name of the parameter introduced for texts written without `=>`.
pub const IMPLICIT_PARAM: &str = "it";

/// Kind of an entity member as seen by the binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    /// Scalar property.
    Scalar,
    /// Single-valued navigation to the given entity type.
    Reference(String),
    /// Collection navigation to the given entity type.
    Collection(String),
}

/// Schema lookups needed for binding.
pub trait SchemaView {
    /// Whether the entity type exists.
    fn has_entity(&self, entity: &str) -> bool;

    /// Own or inherited member of an entity type.
    fn member(&self, entity: &str, name: &str) -> Option<MemberKind>;

    /// Member names of an entity, used for "did you mean" hints.
    fn member_names(&self, entity: &str) -> Vec<String>;
}

/// Static type of a bound expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindType {
    /// Scalar or record value.
    Scalar,
    /// A single entity of the given type.
    Entity(String),
    /// A sequence of entities.
    Entities(String),
    /// A sequence of non-entity values.
    Values,
    /// Untyped (projection results); members are not validated.
    Unknown,
}

impl BindType {
    fn describe(&self) -> String {
        match self {
            BindType::Scalar => "a scalar".to_string(),
            BindType::Entity(ty) => format!("entity '{}'", ty),
            BindType::Entities(ty) => format!("a sequence of '{}'", ty),
            BindType::Values => "a sequence of values".to_string(),
            BindType::Unknown => "an untyped value".to_string(),
        }
    }

    fn is_sequence(&self) -> bool {
        matches!(
            self,
            BindType::Entities(_) | BindType::Values | BindType::Unknown
        )
    }

    /// Element type of a sequence.
    fn element(&self) -> BindType {
        match self {
            BindType::Entities(ty) => BindType::Entity(ty.clone()),
            _ => BindType::Unknown,
        }
    }
}

/// Options controlling what a text may reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindOptions {
    /// Whether `$principal` is allowed (rule texts only).
    pub allow_principal: bool,
}

/// Binds one expression text.
pub struct Binder<'a> {
    schema: &'a dyn SchemaView,
    options: BindOptions,
    /// Kinds of the positional values supplied with this text.
    param_kinds: &'a [ValueKind],
    /// Index of this text's `@0` in the combined parameter list.
    param_offset: usize,
    scopes: Vec<(String, BindType)>,
    implicit: Option<BindType>,
}

impl<'a> Binder<'a> {
    /// Create a binder for a text with the given positional parameters.
    pub fn new(schema: &'a dyn SchemaView, param_kinds: &'a [ValueKind]) -> Self {
        Self {
            schema,
            options: BindOptions::default(),
            param_kinds,
            param_offset: 0,
            scopes: Vec::new(),
            implicit: None,
        }
    }

    pub fn with_options(mut self, options: BindOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_param_offset(mut self, offset: usize) -> Self {
        self.param_offset = offset;
        self
    }

    /// Bind a text as a single-parameter lambda over `element`.
    ///
    /// An explicit `p => body` binds `p`; otherwise the whole text is the
    /// body of an implicit lambda.
    pub fn bind_lambda(
        &mut self,
        node: &Node,
        element: &BindType,
    ) -> Result<(Lambda, BindType), CompileError> {
        match &node.kind {
            NodeKind::Lambda { param, body } => {
                self.scopes.push((param.value.clone(), element.clone()));
                let bound = self.bind(body);
                self.scopes.pop();
                let (body, ty) = bound?;
                Ok((Lambda::new(param.value.clone(), body), ty))
            }
            _ => {
                self.implicit = Some(element.clone());
                let bound = self.bind(node);
                self.implicit = None;
                let (body, ty) = bound?;
                Ok((Lambda::new(IMPLICIT_PARAM, body), ty))
            }
        }
    }

    /// Bind an expression, returning the lowered tree and its static type.
    pub fn bind(&mut self, node: &Node) -> Result<(Expr, BindType), CompileError> {
        match &node.kind {
            NodeKind::Literal(value) => Ok((Expr::Literal(value.clone()), BindType::Scalar)),
            NodeKind::Param(index) => {
                let kind = self.param_kinds.get(*index).ok_or_else(|| {
                    CompileError::new(
                        format!(
                            "parameter @{} is not supplied ({} given)",
                            index,
                            self.param_kinds.len()
                        ),
                        node.span,
                        CompileErrorKind::UnboundParameter,
                    )
                })?;
                let ty = if *kind == ValueKind::List {
                    BindType::Values
                } else {
                    BindType::Scalar
                };
                Ok((Expr::Param(self.param_offset + index), ty))
            }
            NodeKind::Principal => {
                if !self.options.allow_principal {
                    return Err(CompileError::invalid_query(
                        "$principal is only available in rule expressions",
                        node.span,
                    ));
                }
                Ok((Expr::Principal, BindType::Scalar))
            }
            NodeKind::Ident(name) => self.bind_ident(name, node.span),
            NodeKind::Member { target, name } => {
                let (target, target_ty) = self.bind(target)?;
                let ty = self.member_type(&target_ty, &name.value, name.span)?;
                Ok((target.member(name.value.clone()), ty))
            }
            NodeKind::Call {
                target,
                method,
                type_arg,
                args,
            } => self.bind_call(
                target,
                &method.value,
                method.span,
                type_arg.as_ref(),
                args,
                node.span,
            ),
            NodeKind::Unary { op, operand } => {
                let (operand, _) = self.bind(operand)?;
                Ok((
                    Expr::Unary {
                        op: *op,
                        operand: Box::new(operand),
                    },
                    BindType::Scalar,
                ))
            }
            NodeKind::Binary { op, left, right } => {
                let (left, left_ty) = self.bind(left)?;
                let (right, right_ty) = self.bind(right)?;
                let ty = if op.is_predicate() {
                    BindType::Scalar
                } else if left_ty == right_ty {
                    left_ty
                } else {
                    BindType::Scalar
                };
                Ok((Expr::binary(*op, left, right), ty))
            }
            NodeKind::Conditional {
                test,
                then,
                otherwise,
            } => {
                let (test, _) = self.bind(test)?;
                let (then, then_ty) = self.bind(then)?;
                let (otherwise, otherwise_ty) = self.bind(otherwise)?;
                let ty = if then_ty == otherwise_ty {
                    then_ty
                } else {
                    BindType::Unknown
                };
                Ok((
                    Expr::Conditional {
                        test: Box::new(test),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    ty,
                ))
            }
            NodeKind::Lambda { .. } => Err(CompileError::invalid_query(
                "lambda is only allowed as a method argument",
                node.span,
            )),
            NodeKind::Record(fields) => {
                let mut bound = Vec::with_capacity(fields.len());
                for field in fields {
                    let (value, _) = self.bind(&field.value)?;
                    bound.push((field.name.value.clone(), value));
                }
                Ok((Expr::Record(bound), BindType::Scalar))
            }
            NodeKind::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.bind(item).map(|(expr, _)| expr))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((Expr::List(items), BindType::Values))
            }
        }
    }

    fn bind_ident(&mut self, name: &str, span: Span) -> Result<(Expr, BindType), CompileError> {
        if let Some((_, ty)) = self.scopes.iter().rev().find(|(param, _)| param == name) {
            return Ok((Expr::var(name), ty.clone()));
        }

        let Some(implicit) = self.implicit.clone() else {
            return Err(CompileError::new(
                format!("unknown identifier '{}'", name),
                span,
                CompileErrorKind::UnknownIdentifier,
            ));
        };

        // Without an explicit lambda, a member of the element type refers to
        // that member; any other name is the implicit parameter itself.
        if let BindType::Entity(entity) = &implicit {
            if let Some(kind) = self.schema.member(entity, name) {
                let ty = member_kind_type(kind);
                return Ok((Expr::var(IMPLICIT_PARAM).member(name), ty));
            }
        }
        Ok((Expr::var(IMPLICIT_PARAM), implicit))
    }

    fn member_type(
        &self,
        target: &BindType,
        name: &str,
        span: Span,
    ) -> Result<BindType, CompileError> {
        match target {
            BindType::Entity(entity) => match self.schema.member(entity, name) {
                Some(kind) => Ok(member_kind_type(kind)),
                None => {
                    let mut err = CompileError::unknown_member(entity, name, span);
                    if let Some(close) = closest(name, &self.schema.member_names(entity)) {
                        err = err.with_hint(format!("did you mean '{}'?", close));
                    }
                    Err(err)
                }
            },
            BindType::Unknown => Ok(BindType::Unknown),
            other => Err(CompileError::new(
                format!("cannot access member '{}' on {}", name, other.describe()),
                span,
                CompileErrorKind::TypeMismatch,
            )
            .with_hint("use a sequence method such as Select or Any")),
        }
    }

    fn bind_call(
        &mut self,
        target: &Node,
        method_name: &str,
        method_span: Span,
        type_arg: Option<&Spanned<String>>,
        args: &[Node],
        span: Span,
    ) -> Result<(Expr, BindType), CompileError> {
        let (target, target_ty) = self.bind(target)?;

        let method = if method_name == "OfType" {
            let ty = type_arg.ok_or_else(|| {
                CompileError::arity("OfType", "a type argument: OfType<T>()", method_span)
            })?;
            if !self.schema.has_entity(&ty.value) {
                return Err(CompileError::unknown_entity(&ty.value, ty.span));
            }
            Method::OfType(ty.value.clone())
        } else {
            if let Some(ty) = type_arg {
                return Err(CompileError::invalid_query(
                    format!("'{}' does not take a type argument", method_name),
                    ty.span,
                ));
            }
            Method::from_name(method_name)
                .ok_or_else(|| CompileError::unknown_method(method_name, method_span))?
        };

        if !target_ty.is_sequence() {
            return Err(CompileError::new(
                format!(
                    "'{}' requires a sequence, found {}",
                    method_name,
                    target_ty.describe()
                ),
                method_span,
                CompileErrorKind::TypeMismatch,
            ));
        }
        let element = target_ty.element();

        let signature = signature(&method);
        if !signature.accepts(args) {
            return Err(CompileError::arity(method_name, signature.describe(), span));
        }

        let mut bound_args = Vec::with_capacity(args.len());
        let mut lambda_ty = None;
        for arg in args {
            if arg.is_lambda() {
                let (lambda, ty) = self.bind_lambda_arg(arg, &element)?;
                lambda_ty = Some(ty);
                bound_args.push(Expr::Lambda(lambda));
            } else {
                let (value, _) = self.bind(arg)?;
                bound_args.push(value);
            }
        }

        let result = match &method {
            Method::Where
            | Method::OrderBy
            | Method::OrderByDescending
            | Method::ThenBy
            | Method::ThenByDescending
            | Method::Skip
            | Method::Take
            | Method::ToList => target_ty.clone(),
            Method::Select => match lambda_ty {
                Some(BindType::Entity(ty)) => BindType::Entities(ty),
                _ => BindType::Values,
            },
            Method::SelectMany => match lambda_ty {
                Some(BindType::Entities(ty)) => BindType::Entities(ty),
                Some(BindType::Values) | Some(BindType::Unknown) => BindType::Values,
                _ => {
                    return Err(CompileError::type_mismatch(
                        "a sequence-valued projection",
                        "a single value",
                        span,
                    ))
                }
            },
            Method::Any | Method::All | Method::Count | Method::Contains => BindType::Scalar,
            Method::First | Method::FirstOrDefault => element,
            Method::OfType(ty) => match target_ty {
                BindType::Entities(_) => BindType::Entities(ty.clone()),
                _ => {
                    return Err(CompileError::type_mismatch(
                        "a sequence of entities",
                        &target_ty.describe(),
                        method_span,
                    ))
                }
            },
        };

        Ok((target.call(method, bound_args), result))
    }

    fn bind_lambda_arg(
        &mut self,
        node: &Node,
        element: &BindType,
    ) -> Result<(Lambda, BindType), CompileError> {
        // Nested lambdas always carry an explicit parameter; the implicit
        // parameter stays visible inside them.
        match &node.kind {
            NodeKind::Lambda { param, body } => {
                self.scopes.push((param.value.clone(), element.clone()));
                let bound = self.bind(body);
                self.scopes.pop();
                let (body, ty) = bound?;
                Ok((Lambda::new(param.value.clone(), body), ty))
            }
            _ => Err(CompileError::invalid_query("expected a lambda", node.span)),
        }
    }
}

fn member_kind_type(kind: MemberKind) -> BindType {
    match kind {
        MemberKind::Scalar => BindType::Scalar,
        MemberKind::Reference(target) => BindType::Entity(target),
        MemberKind::Collection(target) => BindType::Entities(target),
    }
}

/// Accepted argument forms of a method.
struct Signature {
    /// Allowed argument counts.
    counts: &'static [usize],
    /// Whether the (single) argument must be a lambda.
    lambda: bool,
}

impl Signature {
    fn accepts(&self, args: &[Node]) -> bool {
        self.counts.contains(&args.len()) && args.iter().all(|arg| arg.is_lambda() == self.lambda)
    }

    fn describe(&self) -> &'static str {
        match (self.counts, self.lambda) {
            ([0], _) => "no arguments",
            ([1], true) => "one lambda argument",
            ([1], false) => "one value argument",
            ([0, 1], true) => "no arguments or one lambda argument",
            _ => "different arguments",
        }
    }
}

fn signature(method: &Method) -> Signature {
    match method {
        Method::Where
        | Method::Select
        | Method::SelectMany
        | Method::All
        | Method::OrderBy
        | Method::OrderByDescending
        | Method::ThenBy
        | Method::ThenByDescending => Signature {
            counts: &[1],
            lambda: true,
        },
        Method::Any | Method::Count | Method::First | Method::FirstOrDefault => Signature {
            counts: &[0, 1],
            lambda: true,
        },
        Method::Contains | Method::Skip | Method::Take => Signature {
            counts: &[1],
            lambda: false,
        },
        Method::ToList | Method::OfType(_) => Signature {
            counts: &[0],
            lambda: false,
        },
    }
}

/// Closest candidate by edit distance, if reasonably close.
fn closest<'c>(name: &str, candidates: &'c [String]) -> Option<&'c str> {
    candidates
        .iter()
        .map(|c| (edit_distance(&name.to_lowercase(), &c.to_lowercase()), c))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.as_str())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut current = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            current[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(current[j] + 1);
        }
        prev = current;
    }
    prev[b.len()]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    /// Folder { Id, Name, OwnerId, ParentId, Parent -> Folder, Children -> [Folder], Items -> [Item] }
    /// Item { Id, FolderId, Title, Folder -> Folder }
    pub(crate) struct TestSchema {
        members: HashMap<&'static str, Vec<(&'static str, MemberKind)>>,
    }

    impl TestSchema {
        pub(crate) fn new() -> Self {
            let mut members = HashMap::new();
            members.insert(
                "Folder",
                vec![
                    ("Id", MemberKind::Scalar),
                    ("Name", MemberKind::Scalar),
                    ("OwnerId", MemberKind::Scalar),
                    ("ParentId", MemberKind::Scalar),
                    ("Parent", MemberKind::Reference("Folder".into())),
                    ("Children", MemberKind::Collection("Folder".into())),
                    ("Items", MemberKind::Collection("Item".into())),
                ],
            );
            members.insert(
                "Item",
                vec![
                    ("Id", MemberKind::Scalar),
                    ("FolderId", MemberKind::Scalar),
                    ("Title", MemberKind::Scalar),
                    ("Folder", MemberKind::Reference("Folder".into())),
                ],
            );
            members.insert("Note", vec![("Id", MemberKind::Scalar)]);
            Self { members }
        }
    }

    impl SchemaView for TestSchema {
        fn has_entity(&self, entity: &str) -> bool {
            self.members.contains_key(entity)
        }

        fn member(&self, entity: &str, name: &str) -> Option<MemberKind> {
            self.members
                .get(entity)?
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, k)| k.clone())
        }

        fn member_names(&self, entity: &str) -> Vec<String> {
            self.members
                .get(entity)
                .map(|ms| ms.iter().map(|(n, _)| n.to_string()).collect())
                .unwrap_or_default()
        }
    }

    fn bind_text(text: &str, kinds: &[ValueKind]) -> Result<(Lambda, BindType), CompileError> {
        let schema = TestSchema::new();
        let node = parse(text).unwrap();
        Binder::new(&schema, kinds).bind_lambda(&node, &BindType::Entity("Folder".into()))
    }

    #[test]
    fn test_implicit_parameter_name() {
        let (lambda, _) = bind_text("x.Id > @0", &[ValueKind::Int32]).unwrap();
        assert_eq!(lambda.param, IMPLICIT_PARAM);
        assert_eq!(
            *lambda.body,
            Expr::var(IMPLICIT_PARAM).member("Id").gt(Expr::param(0))
        );
    }

    #[test]
    fn test_implicit_member() {
        let (lambda, ty) = bind_text("Children", &[]).unwrap();
        assert_eq!(*lambda.body, Expr::var(IMPLICIT_PARAM).member("Children"));
        assert_eq!(ty, BindType::Entities("Folder".into()));
    }

    #[test]
    fn test_explicit_lambda() {
        let (lambda, ty) = bind_text("f => f.Items.Count(i => i.Title == 'a')", &[]).unwrap();
        assert_eq!(lambda.param, "f");
        assert_eq!(ty, BindType::Scalar);
    }

    #[test]
    fn test_unknown_member_has_hint() {
        let err = bind_text("x.Nmae == 'a'", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownMember);
        assert_eq!(err.span, Span::new(2, 6));
        assert_eq!(err.hint.as_deref(), Some("did you mean 'Name'?"));
    }

    #[test]
    fn test_unbound_parameter() {
        let err = bind_text("x.Id > @1", &[ValueKind::Int32]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnboundParameter);
    }

    #[test]
    fn test_param_offset() {
        let schema = TestSchema::new();
        let node = parse("x.Id == @0").unwrap();
        let (lambda, _) = Binder::new(&schema, &[ValueKind::Int32])
            .with_param_offset(3)
            .bind_lambda(&node, &BindType::Entity("Folder".into()))
            .unwrap();
        assert_eq!(lambda.body.max_param(), Some(3));
    }

    #[test]
    fn test_principal_requires_rule_context() {
        let err = bind_text("x.OwnerId == $principal", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidQuery);

        let schema = TestSchema::new();
        let node = parse("x => x.OwnerId == $principal").unwrap();
        let bound = Binder::new(&schema, &[])
            .with_options(BindOptions {
                allow_principal: true,
            })
            .bind_lambda(&node, &BindType::Entity("Folder".into()));
        assert!(bound.is_ok());
    }

    #[test]
    fn test_method_arity() {
        let err = bind_text("x.Children.Where()", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ArityMismatch);
        let err = bind_text("x.Children.Take(c => c.Id)", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ArityMismatch);
    }

    #[test]
    fn test_unknown_method() {
        let err = bind_text("x.Children.Explode()", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownMethod);
    }

    #[test]
    fn test_member_on_sequence_is_type_error() {
        let err = bind_text("x.Children.Name", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::TypeMismatch);
    }

    #[test]
    fn test_of_type_requires_known_entity() {
        let err = bind_text("x.Children.OfType<Ghost>()", &[]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownEntity);
        let (_, ty) = bind_text("x.Children.OfType<Note>()", &[]).unwrap();
        assert_eq!(ty, BindType::Entities("Note".into()));
    }

    #[test]
    fn test_list_parameter_contains() {
        let (_, ty) = bind_text("@0.Contains(x.Id)", &[ValueKind::List]).unwrap();
        assert_eq!(ty, BindType::Scalar);
    }

    #[test]
    fn test_select_types() {
        let (_, ty) = bind_text("x.Items.Select(i => i.Folder)", &[]).unwrap();
        assert_eq!(ty, BindType::Entities("Folder".into()));
        let (_, ty) = bind_text("x.Items.Select(i => i.Title)", &[]).unwrap();
        assert_eq!(ty, BindType::Values);
        let (_, ty) = bind_text("x.Children.SelectMany(c => c.Items)", &[]).unwrap();
        assert_eq!(ty, BindType::Entities("Item".into()));
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("name", "name"), 0);
        assert_eq!(edit_distance("nmae", "name"), 2);
        assert_eq!(edit_distance("", "abc"), 3);
    }
}
