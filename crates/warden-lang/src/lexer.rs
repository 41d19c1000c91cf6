//! Lexer for descriptor expressions using logos.

use crate::error::ParseError;
use crate::span::Span;
use logos::Logos;

/// Token types for the expression language.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    // Lambda arrow
    #[token("=>")]
    Arrow,

    // Comparison operators
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    // Logical operators
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("!")]
    Bang,
    #[token("??")]
    Coalesce,
    #[token("?")]
    Question,

    // Arithmetic
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    // Keywords
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("new")]
    New,
    #[token("$principal")]
    Principal,

    // Positional parameter (@0, @1, ...)
    #[regex(r"@[0-9]+", |lex| lex.slice()[1..].parse::<usize>().ok())]
    Param(usize),

    // Identifier
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // String literal (double-quoted)
    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len()-1])
    })]
    // String literal (single-quoted)
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len()-1])
    })]
    String(String),

    // Integer literal (sign is a unary operator)
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    // Float literal
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    // Punctuation
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Assign,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
}

/// Unescape a string literal, handling common escape sequences.
fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// A token with its span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Lexer that produces spanned tokens.
///
/// Unlike a plain iterator, unrecognized input is surfaced as a
/// [`ParseError`] so that a malformed expression never compiles.
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<Option<Result<SpannedToken, ParseError>>>,
}

impl<'source> Lexer<'source> {
    /// Create a new lexer for the given source.
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Peek at the next token without consuming it.
    pub fn peek(&mut self) -> Option<&SpannedToken> {
        if self.peeked.is_none() {
            self.peeked = Some(self.next_inner());
        }
        match self.peeked.as_ref() {
            Some(Some(Ok(tok))) => Some(tok),
            _ => None,
        }
    }

    /// Get the next token.
    pub fn next_token(&mut self) -> Option<Result<SpannedToken, ParseError>> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.next_inner(),
        }
    }

    fn next_inner(&mut self) -> Option<Result<SpannedToken, ParseError>> {
        let token = self.inner.next()?;
        let span: Span = self.inner.span().into();
        Some(match token {
            Ok(token) => Ok(SpannedToken { token, span }),
            Err(()) => Err(ParseError::new(
                format!("unexpected character sequence '{}'", self.inner.slice()),
                span,
            )),
        })
    }

    /// Get the current position in the source.
    pub fn span(&self) -> Span {
        self.inner.span().into()
    }

    /// Get the source string.
    pub fn source(&self) -> &'source str {
        self.inner.source()
    }
}

/// Tokenize a source string into a vector of spanned tokens.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, ParseError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next_token() {
        tokens.push(tok?);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_simple_predicate() {
        assert_eq!(
            kinds("x.Id > @0"),
            vec![
                Token::Ident("x".to_string()),
                Token::Dot,
                Token::Ident("Id".to_string()),
                Token::Gt,
                Token::Param(0),
            ]
        );
    }

    #[test]
    fn test_lambda_arrow() {
        let tokens = kinds("c => c.Name == 'a'");
        assert_eq!(tokens[1], Token::Arrow);
        assert_eq!(tokens[5], Token::Eq);
        assert_eq!(tokens[6], Token::String("a".to_string()));
    }

    #[test]
    fn test_operators() {
        let tokens = kinds("a == b && c != d || e <= f ?? g");
        assert!(tokens.contains(&Token::Eq));
        assert!(tokens.contains(&Token::And));
        assert!(tokens.contains(&Token::Ne));
        assert!(tokens.contains(&Token::Or));
        assert!(tokens.contains(&Token::Le));
        assert!(tokens.contains(&Token::Coalesce));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("123 3.25 -4"),
            vec![
                Token::Int(123),
                Token::Float(3.25),
                Token::Minus,
                Token::Int(4)
            ]
        );
    }

    #[test]
    fn test_keywords_and_principal() {
        assert_eq!(
            kinds("true false null new $principal"),
            vec![
                Token::True,
                Token::False,
                Token::Null,
                Token::New,
                Token::Principal
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = kinds(r#""hello\nworld""#);
        assert_eq!(tokens[0], Token::String("hello\nworld".to_string()));
    }

    #[test]
    fn test_invalid_character_is_an_error() {
        let err = tokenize("x.Id # 4").unwrap_err();
        assert!(err.message.contains('#'));
        assert_eq!(err.span, Span::new(5, 6));
    }

    #[test]
    fn test_lexer_peek() {
        let mut lexer = Lexer::new("a.b");
        assert_eq!(
            lexer.peek().map(|t| &t.token),
            Some(&Token::Ident("a".to_string()))
        );
        assert_eq!(
            lexer.next_token().map(|t| t.unwrap().token),
            Some(Token::Ident("a".to_string()))
        );
        assert_eq!(
            lexer.next_token().map(|t| t.unwrap().token),
            Some(Token::Dot)
        );
    }
}
