//! Warden descriptor language.
//!
//! Callers compose queries as lists of `[operation, expression, ...params]`
//! descriptors. This crate parses the expression texts, binds them against
//! the schema and memoizes the compiled operation lists.
//!
//! # Expression syntax
//!
//! ```text
//! x.Id > @0
//! x => x.Children.Any(c => c.OwnerId == @0)
//! new { Title = x.Name, x.Owner.Email }
//! Children.Items
//! x.Assets.OfType<Image>().Count()
//! ```
//!
//! A text without `=>` is the body of a lambda over the row: identifiers
//! naming a member of the row type refer to that member, and any other
//! identifier is the row itself.
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_lang::DescriptorCompiler;
//!
//! let compiler = DescriptorCompiler::new(schema);
//! let compiled = compiler.compile("Folder", &descriptors, &cancel)?;
//! let plan = compiled.bind(&params)?;
//! ```

pub mod ast;
pub mod binder;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod span;

pub use binder::{BindOptions, BindType, Binder, MemberKind, SchemaView, IMPLICIT_PARAM};
pub use compiler::{
    compile_predicate, CompileKey, CompiledQuery, CompilerStats, DescriptorCompiler,
    DEFAULT_CACHE_CAPACITY,
};
pub use error::{CompileError, CompileErrorKind, LangError, ParseError};
pub use span::{Span, Spanned};

/// Parse an expression text into a syntax tree.
pub fn parse(source: &str) -> Result<ast::Node, ParseError> {
    parser::parse(source)
}

/// Tokenize an expression text (for debugging/testing).
pub fn tokenize(source: &str) -> Result<Vec<lexer::SpannedToken>, ParseError> {
    lexer::tokenize(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_with_source_context() {
        let source = "x.Id = 5";
        let err = parse(source).unwrap_err();
        let formatted = err.format_with_source(source);
        assert!(formatted.contains("line 1:6"));
        assert!(formatted.contains("hint"));
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Children.Items").unwrap();
        assert_eq!(tokens.len(), 3);
    }
}
