//! Security-specific error types.

use serde::Serialize;
use thiserror::Error;
use warden_lang::LangError;

use super::rule::Operation;

/// One user-visible `(field, reason)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Offending field, `Type.Field`, or the entity type for row-level errors.
    pub field: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Security-related errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// No rule is registered for a reachable type; access is denied.
    #[error("no {operation} rule defined for '{entity}'")]
    RuleNotDefined { entity: String, operation: Operation },

    /// A rule excluded the row, or post-save verification failed.
    #[error("access denied: {operation} on '{entity}': {reason}")]
    AccessDenied {
        entity: String,
        operation: Operation,
        reason: String,
    },

    /// Field validation failed for one or more entities.
    #[error("validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<FieldError>),

    /// A descriptor expression failed to compile.
    #[error("compilation failed: {message}")]
    CompilationFailed {
        message: String,
        /// Rendered diagnostic with source context.
        detail: Option<String>,
    },

    /// An expression the filter injection cannot rewrite safely.
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage error during rule evaluation or persistence.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;

impl SecurityError {
    pub fn access_denied(
        entity: impl Into<String>,
        operation: Operation,
        reason: impl Into<String>,
    ) -> Self {
        SecurityError::AccessDenied {
            entity: entity.into(),
            operation,
            reason: reason.into(),
        }
    }

    /// The user-visible `(field, reason)` list for this error.
    pub fn field_errors(&self) -> Vec<FieldError> {
        match self {
            SecurityError::ValidationFailed(errors) => errors.clone(),
            SecurityError::RuleNotDefined { entity, operation } => vec![FieldError::new(
                entity.clone(),
                format!("no {} rule defined", operation),
            )],
            SecurityError::AccessDenied { entity, reason, .. } => {
                vec![FieldError::new(entity.clone(), reason.clone())]
            }
            SecurityError::CompilationFailed { message, .. } => {
                vec![FieldError::new("descriptors", message.clone())]
            }
            SecurityError::UnsupportedShape(message) => {
                vec![FieldError::new("query", message.clone())]
            }
            SecurityError::Cancelled => vec![FieldError::new("request", "cancelled")],
            SecurityError::Storage(err) => vec![FieldError::new("storage", err.to_string())],
        }
    }
}

impl From<LangError> for SecurityError {
    fn from(err: LangError) -> Self {
        match err.root_cause() {
            LangError::UnsupportedOperation(op) => {
                SecurityError::UnsupportedShape(format!("unsupported descriptor operation '{}'", op))
            }
            LangError::Cancelled => SecurityError::Cancelled,
            _ => SecurityError::CompilationFailed {
                detail: Some(err.format_with_source("")),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SecurityError::RuleNotDefined {
            entity: "Folder".to_string(),
            operation: Operation::Select,
        };
        assert_eq!(err.to_string(), "no select rule defined for 'Folder'");

        let err = SecurityError::access_denied("Folder", Operation::Insert, "row not visible");
        assert!(err.to_string().contains("insert on 'Folder'"));
    }

    #[test]
    fn test_field_errors_never_empty() {
        let errors = [
            SecurityError::RuleNotDefined {
                entity: "A".into(),
                operation: Operation::Delete,
            },
            SecurityError::access_denied("A", Operation::Update, "denied"),
            SecurityError::CompilationFailed {
                message: "bad".into(),
                detail: None,
            },
            SecurityError::UnsupportedShape("x".into()),
            SecurityError::Cancelled,
        ];
        for err in &errors {
            assert!(!err.field_errors().is_empty(), "{}", err);
        }

        let validation = SecurityError::ValidationFailed(vec![
            FieldError::new("Folder.Name", "must not be null"),
            FieldError::new("Folder.Size", "expected int32, got string"),
        ]);
        assert_eq!(validation.field_errors().len(), 2);
        assert_eq!(validation.to_string(), "validation failed with 2 error(s)");
    }

    #[test]
    fn test_lang_error_mapping() {
        let err: SecurityError = LangError::UnsupportedOperation("explode".into()).into();
        assert!(matches!(err, SecurityError::UnsupportedShape(_)));

        let err: SecurityError = LangError::Cancelled.into();
        assert!(matches!(err, SecurityError::Cancelled));

        let err: SecurityError = LangError::ParameterCount {
            expected: 1,
            actual: 0,
        }
        .into();
        assert!(matches!(err, SecurityError::CompilationFailed { .. }));
    }
}
