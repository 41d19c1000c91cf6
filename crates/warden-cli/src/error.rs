//! CLI error type.

use thiserror::Error;
use warden_core::security::SecurityError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Core(#[from] warden_core::Error),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CliError {
    /// `(field, reason)` lines for security errors, the message otherwise.
    pub fn details(&self) -> Vec<String> {
        match self {
            CliError::Security(err) => err
                .field_errors()
                .into_iter()
                .map(|e| format!("{}: {}", e.field, e.reason))
                .collect(),
            other => vec![other.to_string()],
        }
    }
}
