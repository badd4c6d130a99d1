//! Common error types for proxy-manager components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A specialized Result type for proxy-manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine-readable error category.
///
/// Adapters (HTTP, alerts) key their behaviour off the kind; the detail
/// string is for humans only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DuplicatePath,
    ValidationError,
    TemplateError,
    WriteError,
    SyntaxError,
    CommandFailure,
    Timeout,
    InvalidState,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicatePath => "duplicate_path",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::TemplateError => "template_error",
            ErrorKind::WriteError => "write_error",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::CommandFailure => "command_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common error type for proxy-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate path: {0}")]
    DuplicatePath(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Command failed: {0}")]
    CommandFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DuplicatePath(_) => ErrorKind::DuplicatePath,
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::Template(_) => ErrorKind::TemplateError,
            Error::Write(_) => ErrorKind::WriteError,
            Error::Syntax(_) => ErrorKind::SyntaxError,
            Error::CommandFailure(_) => ErrorKind::CommandFailure,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Io(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn detail(&self) -> String {
        match self {
            Error::NotFound(msg)
            | Error::DuplicatePath(msg)
            | Error::Validation(msg)
            | Error::Template(msg)
            | Error::Write(msg)
            | Error::Syntax(msg)
            | Error::CommandFailure(msg)
            | Error::Timeout(msg)
            | Error::InvalidState(msg)
            | Error::Serialization(msg) => msg.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    /// Create a new not-found error.
    pub fn not_found(msg: impl fmt::Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    /// Create a new duplicate-path error.
    pub fn duplicate_path(msg: impl fmt::Display) -> Self {
        Error::DuplicatePath(msg.to_string())
    }

    /// Create a new validation error.
    pub fn validation(msg: impl fmt::Display) -> Self {
        Error::Validation(msg.to_string())
    }

    /// Create a new template error.
    pub fn template(msg: impl fmt::Display) -> Self {
        Error::Template(msg.to_string())
    }

    /// Create a new write error.
    pub fn write(msg: impl fmt::Display) -> Self {
        Error::Write(msg.to_string())
    }

    /// Create a new syntax error.
    pub fn syntax(msg: impl fmt::Display) -> Self {
        Error::Syntax(msg.to_string())
    }

    /// Create a new command failure.
    pub fn command(msg: impl fmt::Display) -> Self {
        Error::CommandFailure(msg.to_string())
    }

    /// Create a new timeout error.
    pub fn timeout(msg: impl fmt::Display) -> Self {
        Error::Timeout(msg.to_string())
    }

    /// Create a new invalid-state error.
    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Error::InvalidState(msg.to_string())
    }

    /// Create a new serialization error.
    pub fn serialization(msg: impl fmt::Display) -> Self {
        Error::Serialization(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
