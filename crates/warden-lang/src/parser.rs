//! Recursive descent parser for descriptor expressions.
//!
//! Precedence, lowest first:
//!
//! ```text
//! lambda       := IDENT "=>" expr | conditional
//! conditional  := coalesce ("?" expr ":" expr)?
//! coalesce     := or ("??" or)*
//! or           := and ("||" and)*
//! and          := equality ("&&" equality)*
//! equality     := relational (("==" | "!=") relational)*
//! relational   := additive (("<" | "<=" | ">" | ">=") additive)*
//! additive     := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/" | "%") unary)*
//! unary        := ("!" | "-") unary | postfix
//! postfix      := primary ("." IDENT ("<" IDENT ">")? ("(" args ")")?)*
//! ```

use warden_proto::{BinaryOp, UnaryOp, Value};

use crate::ast::{Node, NodeKind, RecordField};
use crate::error::ParseError;
use crate::lexer::{Lexer, SpannedToken, Token};
use crate::span::{Span, Spanned};

/// Parser for a single descriptor expression.
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    source: &'source str,
}

impl<'source> Parser<'source> {
    /// Create a new parser for the given source.
    pub fn new(source: &'source str) -> Self {
        Self {
            lexer: Lexer::new(source),
            source,
        }
    }

    /// Parse a complete expression; trailing tokens are an error.
    pub fn parse_expression(&mut self) -> Result<Node, ParseError> {
        let expr = self.parse_lambda()?;
        if let Some(tok) = self.lexer.next_token() {
            let tok = tok?;
            return Err(ParseError::new(
                format!("unexpected {:?} after end of expression", tok.token),
                tok.span,
            ));
        }
        Ok(expr)
    }

    fn parse_lambda(&mut self) -> Result<Node, ParseError> {
        let expr = self.parse_conditional()?;
        if !self.peek_is(&Token::Arrow) {
            return Ok(expr);
        }
        let arrow = self.next_token()?;
        let param = match expr.kind {
            NodeKind::Ident(name) => Spanned::new(name, expr.span),
            _ => {
                return Err(ParseError::new("lambda parameter must be an identifier", expr.span)
                    .with_hint("write lambdas as 'x => x.Member'"))
            }
        };
        if self.lexer.peek().is_none() {
            return Err(ParseError::new("expected lambda body", arrow.span));
        }
        let body = self.parse_lambda()?;
        let span = param.span.merge(body.span);
        Ok(Node::new(
            NodeKind::Lambda {
                param,
                body: Box::new(body),
            },
            span,
        ))
    }

    fn parse_conditional(&mut self) -> Result<Node, ParseError> {
        let test = self.parse_coalesce()?;
        if !self.peek_is(&Token::Question) {
            return Ok(test);
        }
        self.next_token()?;
        let then = self.parse_lambda()?;
        self.expect_token(Token::Colon)?;
        let otherwise = self.parse_lambda()?;
        let span = test.span.merge(otherwise.span);
        Ok(Node::new(
            NodeKind::Conditional {
                test: Box::new(test),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    fn parse_coalesce(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(&[(Token::Coalesce, BinaryOp::Coalesce)], Self::parse_or)
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(&[(Token::Or, BinaryOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(&[(Token::And, BinaryOp::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Node, ParseError> {
        if let Some(tok) = self.lexer.peek() {
            // A lone '=' at the start of an expression is never valid
            if tok.token == Token::Assign {
                let span = tok.span;
                return Err(self.assign_error(span));
            }
        }
        let node = self.parse_binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::Ne, BinaryOp::Ne)],
            Self::parse_relational,
        )?;
        if let Some(tok) = self.lexer.peek() {
            if tok.token == Token::Assign {
                let span = tok.span;
                return Err(self.assign_error(span));
            }
        }
        Ok(node)
    }

    fn parse_relational(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(
            &[
                (Token::Lt, BinaryOp::Lt),
                (Token::Le, BinaryOp::Le),
                (Token::Gt, BinaryOp::Gt),
                (Token::Ge, BinaryOp::Ge),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Mod),
            ],
            Self::parse_unary,
        )
    }

    /// Left-associative binary operator level.
    fn parse_binary_level(
        &mut self,
        operators: &[(Token, BinaryOp)],
        mut operand: impl FnMut(&mut Self) -> Result<Node, ParseError>,
    ) -> Result<Node, ParseError> {
        let mut left = operand(self)?;

        loop {
            let op = match self.lexer.peek() {
                Some(tok) => operators
                    .iter()
                    .find(|(token, _)| *token == tok.token)
                    .map(|(_, op)| *op),
                None => None,
            };
            let Some(op) = op else { break };
            self.next_token()?;

            let right = operand(self)?;
            let span = left.span.merge(right.span);
            left = Node::new(
                NodeKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, ParseError> {
        let op = match self.lexer.peek().map(|t| &t.token) {
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Minus) => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        let op_tok = self.next_token()?;
        let operand = self.parse_unary()?;
        let span = op_tok.span.merge(operand.span);

        // Fold negative numeric literals
        if op == UnaryOp::Neg {
            match &operand.kind {
                NodeKind::Literal(Value::Int32(n)) => {
                    return Ok(Node::new(NodeKind::Literal(Value::Int32(-n)), span))
                }
                NodeKind::Literal(Value::Int64(n)) => {
                    return Ok(Node::new(NodeKind::Literal(int_value(-n)), span))
                }
                NodeKind::Literal(Value::Float64(n)) => {
                    return Ok(Node::new(NodeKind::Literal(Value::Float64(-n)), span))
                }
                _ => {}
            }
        }

        Ok(Node::new(
            NodeKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_primary()?;

        while self.peek_is(&Token::Dot) {
            self.next_token()?;
            let name = self.expect_ident()?;

            let type_arg = if self.peek_is(&Token::Lt) {
                self.next_token()?;
                let ty = self.expect_ident()?;
                self.expect_token(Token::Gt)?;
                Some(ty)
            } else {
                None
            };

            if self.peek_is(&Token::LParen) {
                self.next_token()?;
                let args = self.parse_args(Token::RParen)?;
                let close = self.expect_token(Token::RParen)?;
                let span = node.span.merge(close.span);
                node = Node::new(
                    NodeKind::Call {
                        target: Box::new(node),
                        method: name,
                        type_arg,
                        args,
                    },
                    span,
                );
            } else if let Some(ty) = type_arg {
                return Err(ParseError::new(
                    format!("expected '(' after '{}<{}>'", name.value, ty.value),
                    ty.span,
                ));
            } else {
                let span = node.span.merge(name.span);
                node = Node::new(
                    NodeKind::Member {
                        target: Box::new(node),
                        name,
                    },
                    span,
                );
            }
        }

        Ok(node)
    }

    /// Comma-separated expressions up to (not including) `close`.
    fn parse_args(&mut self, close: Token) -> Result<Vec<Node>, ParseError> {
        let mut args = Vec::new();
        if self.peek_is(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_lambda()?);
            if self.peek_is(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        let tok = self.next_token()?;
        let span = tok.span;
        let kind = match tok.token {
            Token::Int(n) => NodeKind::Literal(int_value(n)),
            Token::Float(f) => NodeKind::Literal(Value::Float64(f)),
            Token::String(s) => NodeKind::Literal(Value::String(s)),
            Token::True => NodeKind::Literal(Value::Bool(true)),
            Token::False => NodeKind::Literal(Value::Bool(false)),
            Token::Null => NodeKind::Literal(Value::Null),
            Token::Param(index) => NodeKind::Param(index),
            Token::Principal => NodeKind::Principal,
            Token::Ident(name) => NodeKind::Ident(name),
            Token::LParen => {
                let inner = self.parse_lambda()?;
                let close = self.expect_token(Token::RParen)?;
                return Ok(Node::new(inner.kind, span.merge(close.span)));
            }
            Token::LBracket => {
                let items = self.parse_args(Token::RBracket)?;
                let close = self.expect_token(Token::RBracket)?;
                return Ok(Node::new(NodeKind::List(items), span.merge(close.span)));
            }
            Token::New => return self.parse_record(span),
            other => {
                return Err(ParseError::new(
                    format!("expected expression, found {:?}", other),
                    span,
                ))
            }
        };
        Ok(Node::new(kind, span))
    }

    /// `new { A = e, x.B }` after the `new` keyword.
    fn parse_record(&mut self, start: Span) -> Result<Node, ParseError> {
        self.expect_token(Token::LBrace)?;
        let mut fields: Vec<RecordField> = Vec::new();

        while !self.peek_is(&Token::RBrace) {
            let first = self.parse_conditional_allowing_assign()?;
            let field = if self.peek_is(&Token::Assign) {
                self.next_token()?;
                let name = match first.kind {
                    NodeKind::Ident(name) => Spanned::new(name, first.span),
                    _ => {
                        return Err(ParseError::new(
                            "record field name must be an identifier",
                            first.span,
                        ))
                    }
                };
                let value = self.parse_lambda()?;
                RecordField { name, value }
            } else {
                let name = first.trailing_name().map(str::to_string).ok_or_else(|| {
                    ParseError::new("cannot infer record field name", first.span)
                        .with_hint("name the field explicitly: 'new { Name = ... }'")
                })?;
                RecordField {
                    name: Spanned::new(name, first.span),
                    value: first,
                }
            };

            if fields.iter().any(|f| f.name.value == field.name.value) {
                return Err(ParseError::new(
                    format!("duplicate record field '{}'", field.name.value),
                    field.name.span,
                ));
            }
            fields.push(field);

            if self.peek_is(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }

        let close = self.expect_token(Token::RBrace)?;
        Ok(Node::new(NodeKind::Record(fields), start.merge(close.span)))
    }

    /// Record fields may be `Name = value`; parse the left side without
    /// rejecting a following `=`.
    fn parse_conditional_allowing_assign(&mut self) -> Result<Node, ParseError> {
        self.parse_binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::Ne, BinaryOp::Ne)],
            Self::parse_relational,
        )
    }

    fn assign_error(&self, span: Span) -> ParseError {
        ParseError::new("expected '==' but found '='", span)
            .with_hint("use '==' for equality comparison")
    }

    fn peek_is(&mut self, expected: &Token) -> bool {
        self.lexer
            .peek()
            .map(|tok| std::mem::discriminant(&tok.token) == std::mem::discriminant(expected))
            .unwrap_or(false)
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>, ParseError> {
        let tok = self.next_token()?;
        match tok.token {
            Token::Ident(name) => Ok(Spanned::new(name, tok.span)),
            _ => Err(ParseError::new(
                format!("expected identifier, found {:?}", tok.token),
                tok.span,
            )),
        }
    }

    fn expect_token(&mut self, expected: Token) -> Result<SpannedToken, ParseError> {
        let tok = self.next_token()?;
        if std::mem::discriminant(&tok.token) == std::mem::discriminant(&expected) {
            Ok(tok)
        } else {
            Err(ParseError::new(
                format!("expected {:?}, found {:?}", expected, tok.token),
                tok.span,
            ))
        }
    }

    fn next_token(&mut self) -> Result<SpannedToken, ParseError> {
        self.lexer.next_token().unwrap_or_else(|| {
            Err(ParseError::new(
                "unexpected end of input",
                Span::point(self.source.len()),
            ))
        })
    }
}

/// Integer literals use the smallest of 32/64-bit that fits.
fn int_value(n: i64) -> Value {
    match i32::try_from(n) {
        Ok(small) => Value::Int32(small),
        Err(_) => Value::Int64(n),
    }
}

/// Parse a source string into a syntax tree.
pub fn parse(source: &str) -> Result<Node, ParseError> {
    if source.trim().is_empty() {
        return Err(ParseError::new("empty expression", Span::point(0)));
    }
    Parser::new(source).parse_expression()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kind(source: &str) -> NodeKind {
        parse(source).unwrap().kind
    }

    #[test]
    fn test_parse_member_comparison() {
        let node = parse("x.Id > @0").unwrap();
        match node.kind {
            NodeKind::Binary { op, left, right } => {
                assert_eq!(op, BinaryOp::Gt);
                assert!(matches!(left.kind, NodeKind::Member { ref name, .. } if name.value == "Id"));
                assert_eq!(right.kind, NodeKind::Param(0));
            }
            other => panic!("expected binary, got {:?}", other),
        }
        assert_eq!(node.span, Span::new(0, 9));
    }

    #[test]
    fn test_parse_lambda() {
        match kind("c => c.OwnerId == $principal") {
            NodeKind::Lambda { param, body } => {
                assert_eq!(param.value, "c");
                assert!(matches!(body.kind, NodeKind::Binary { op: BinaryOp::Eq, .. }));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        match kind("a || b && c") {
            NodeKind::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Or);
                assert!(matches!(right.kind, NodeKind::Binary { op: BinaryOp::And, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_is_left_associative() {
        match kind("1 - 2 - 3") {
            NodeKind::Binary { op, left, right } => {
                assert_eq!(op, BinaryOp::Sub);
                assert!(matches!(left.kind, NodeKind::Binary { op: BinaryOp::Sub, .. }));
                assert_eq!(right.kind, NodeKind::Literal(Value::Int32(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negative_literals_fold() {
        assert_eq!(kind("-4"), NodeKind::Literal(Value::Int32(-4)));
        assert_eq!(kind("-2.5"), NodeKind::Literal(Value::Float64(-2.5)));
        assert_eq!(kind("5000000000"), NodeKind::Literal(Value::Int64(5_000_000_000)));
    }

    #[test]
    fn test_method_call_with_nested_lambda() {
        match kind("x.Children.Any(c => c.Visible)") {
            NodeKind::Call {
                method,
                type_arg,
                args,
                ..
            } => {
                assert_eq!(method.value, "Any");
                assert!(type_arg.is_none());
                assert_eq!(args.len(), 1);
                assert!(args[0].is_lambda());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_of_type_call() {
        match kind("x.Assets.OfType<Image>()") {
            NodeKind::Call {
                method, type_arg, ..
            } => {
                assert_eq!(method.value, "OfType");
                assert_eq!(type_arg.map(|t| t.value), Some("Image".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_record_construction() {
        match kind("new { Title = x.Name, x.Owner.Email }") {
            NodeKind::Record(fields) => {
                let names: Vec<_> = fields.iter().map(|f| f.name.value.as_str()).collect();
                assert_eq!(names, vec!["Title", "Email"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_record_duplicate_field() {
        let err = parse("new { A = 1, A = 2 }").unwrap_err();
        assert!(err.message.contains("duplicate record field"));
    }

    #[test]
    fn test_list_and_conditional() {
        assert!(matches!(kind("[1, 2, 3]"), NodeKind::List(ref items) if items.len() == 3));
        assert!(matches!(kind("x.A ? 1 : 2"), NodeKind::Conditional { .. }));
        assert!(matches!(
            kind("x.Name ?? 'none'"),
            NodeKind::Binary {
                op: BinaryOp::Coalesce,
                ..
            }
        ));
    }

    #[test]
    fn test_single_equals_is_rejected_with_hint() {
        let err = parse("x.Id = 5").unwrap_err();
        assert_eq!(err.span, Span::new(5, 6));
        assert!(err.hint.unwrap().contains("=="));
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        assert!(parse("x.Id 5").is_err());
        assert!(parse("(x.Id").is_err());
        assert!(parse("").is_err());
        assert!(parse("x =>").is_err());
    }

    #[test]
    fn test_lambda_parameter_must_be_identifier() {
        let err = parse("x.A => 1").unwrap_err();
        assert!(err.message.contains("lambda parameter"));
    }
}
