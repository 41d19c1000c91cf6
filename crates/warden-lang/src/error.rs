//! Error types for parsing and compiling descriptor expressions.

use crate::span::{offset_to_line_col, Span};
use thiserror::Error;

/// Error during lexing/parsing.
#[derive(Debug, Clone, Error)]
pub struct ParseError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Optional hint for fixing the error.
    pub hint: Option<String>,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ParseError {
    /// Create a new parse error.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            hint: None,
        }
    }

    /// Add a hint to the error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        render("error", &self.message, self.span, self.hint.as_deref(), source)
    }
}

/// Error while binding a parsed expression against the schema.
#[derive(Debug, Clone, Error)]
pub struct CompileError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Error kind for programmatic handling.
    pub kind: CompileErrorKind,
    /// Optional hint for fixing the error.
    pub hint: Option<String>,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Kinds of compilation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Unknown entity type.
    UnknownEntity,
    /// Unknown property or navigation.
    UnknownMember,
    /// Unknown sequence method.
    UnknownMethod,
    /// Identifier that is not a lambda parameter.
    UnknownIdentifier,
    /// Wrong number or form of method arguments.
    ArityMismatch,
    /// Expression has the wrong shape for its position.
    TypeMismatch,
    /// `@N` outside the supplied parameters.
    UnboundParameter,
    /// Invalid query structure.
    InvalidQuery,
}

impl CompileError {
    /// Create a new compile error.
    pub fn new(message: impl Into<String>, span: Span, kind: CompileErrorKind) -> Self {
        Self {
            message: message.into(),
            span,
            kind,
            hint: None,
        }
    }

    /// Add a hint to the error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn unknown_entity(entity: &str, span: Span) -> Self {
        Self::new(
            format!("unknown entity '{}'", entity),
            span,
            CompileErrorKind::UnknownEntity,
        )
    }

    pub fn unknown_member(entity: &str, member: &str, span: Span) -> Self {
        Self::new(
            format!("unknown member '{}' on entity '{}'", member, entity),
            span,
            CompileErrorKind::UnknownMember,
        )
    }

    pub fn unknown_method(method: &str, span: Span) -> Self {
        Self::new(
            format!("unknown method '{}'", method),
            span,
            CompileErrorKind::UnknownMethod,
        )
    }

    pub fn arity(method: &str, expected: &str, span: Span) -> Self {
        Self::new(
            format!("'{}' expects {}", method, expected),
            span,
            CompileErrorKind::ArityMismatch,
        )
    }

    pub fn type_mismatch(expected: &str, got: &str, span: Span) -> Self {
        Self::new(
            format!("type mismatch: expected {}, got {}", expected, got),
            span,
            CompileErrorKind::TypeMismatch,
        )
    }

    pub fn invalid_query(message: impl Into<String>, span: Span) -> Self {
        Self::new(message, span, CompileErrorKind::InvalidQuery)
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        let label = format!("error[{:?}]", self.kind);
        render(&label, &self.message, self.span, self.hint.as_deref(), source)
    }
}

fn render(label: &str, message: &str, span: Span, hint: Option<&str>, source: &str) -> String {
    let (line, col) = offset_to_line_col(source, span.start);
    let mut result = format!("{}: {}\n", label, message);
    result.push_str(&format!("  --> line {}:{}\n", line, col));

    if let Some(source_line) = source.lines().nth(line - 1) {
        result.push_str(&format!("   |\n{:3}| {}\n   |", line, source_line));

        for _ in 0..col {
            result.push(' ');
        }
        result.push('^');

        // Underline the rest of the span on this line
        let span_len = span.end.saturating_sub(span.start);
        let room = source_line.len().saturating_sub(col.saturating_sub(1));
        for _ in 1..span_len.min(room) {
            result.push('~');
        }
        result.push('\n');
    }

    if let Some(hint) = hint {
        result.push_str(&format!("   = hint: {}\n", hint));
    }

    result
}

/// Errors surfaced by the descriptor compiler.
#[derive(Debug, Error)]
pub enum LangError {
    /// Parse error.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// Compile error.
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    /// An error inside one descriptor of a list.
    #[error("descriptor {index} ('{operation}'): {error}")]
    Descriptor {
        index: usize,
        operation: String,
        expression: String,
        #[source]
        error: Box<LangError>,
    },
    /// Descriptor operation name that is not part of the protocol.
    #[error("unsupported descriptor operation '{0}'")]
    UnsupportedOperation(String),
    /// Wrong number of values supplied to a compiled query.
    #[error("expected {expected} parameter values, got {actual}")]
    ParameterCount { expected: usize, actual: usize },
    /// Parameter binding failed.
    #[error("parameter binding failed: {0}")]
    Bind(#[from] warden_proto::Error),
    /// The compile was cancelled before it completed.
    #[error("compilation cancelled")]
    Cancelled,
}

impl LangError {
    /// Format the error with source context.
    ///
    /// Errors inside a descriptor are rendered against that descriptor's own
    /// expression text; `source` is used otherwise.
    pub fn format_with_source(&self, source: &str) -> String {
        match self {
            LangError::Parse(e) => e.format_with_source(source),
            LangError::Compile(e) => e.format_with_source(source),
            LangError::Descriptor {
                index,
                operation,
                expression,
                error,
            } => format!(
                "in descriptor {} ('{}'):\n{}",
                index,
                operation,
                error.format_with_source(expression)
            ),
            other => format!("error: {}\n", other),
        }
    }

    /// Span of the error, when it points into source text.
    pub fn span(&self) -> Option<Span> {
        match self {
            LangError::Parse(e) => Some(e.span),
            LangError::Compile(e) => Some(e.span),
            LangError::Descriptor { error, .. } => error.span(),
            LangError::UnsupportedOperation(_)
            | LangError::ParameterCount { .. }
            | LangError::Bind(_)
            | LangError::Cancelled => None,
        }
    }

    /// The innermost error, unwrapping descriptor context.
    pub fn root_cause(&self) -> &LangError {
        match self {
            LangError::Descriptor { error, .. } => error.root_cause(),
            other => other,
        }
    }

    /// Wrap this error with the descriptor it came from.
    pub fn in_descriptor(self, index: usize, operation: &str, expression: &str) -> Self {
        match self {
            LangError::Cancelled | LangError::UnsupportedOperation(_) => self,
            error => LangError::Descriptor {
                index,
                operation: operation.to_string(),
                expression: expression.to_string(),
                error: Box::new(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_formatting() {
        let source = "x.Id = 5";
        let err = ParseError::new("expected '==' but found '='", Span::new(5, 6))
            .with_hint("use '==' for equality comparison");

        let formatted = err.format_with_source(source);
        assert!(formatted.contains("line 1:6"));
        assert!(formatted.contains("expected '==' but found '='"));
        assert!(formatted.contains("hint: use '==' for equality"));
    }

    #[test]
    fn test_compile_error_formatting_includes_kind() {
        let source = "x.Nme == 'a'";
        let err = CompileError::unknown_member("Folder", "Nme", Span::new(2, 5));
        let formatted = err.format_with_source(source);
        assert!(formatted.contains("error[UnknownMember]"));
        assert!(formatted.contains("^~~"));
    }

    #[test]
    fn test_descriptor_context_renders_inner_source() {
        let inner = LangError::from(CompileError::unknown_member("Folder", "Nme", Span::new(2, 5)));
        let err = inner.in_descriptor(1, "where", "x.Nme == 'a'");
        let formatted = err.format_with_source("");
        assert!(formatted.contains("descriptor 1 ('where')"));
        assert!(formatted.contains("x.Nme == 'a'"));
        assert!(matches!(err.root_cause(), LangError::Compile(_)));
        assert_eq!(err.span(), Some(Span::new(2, 5)));
    }

    #[test]
    fn test_cancelled_is_not_wrapped() {
        let err = LangError::Cancelled.in_descriptor(0, "where", "x");
        assert!(matches!(err, LangError::Cancelled));
    }
}
