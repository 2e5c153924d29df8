// src/error.rs

//! Error taxonomy shared by every engine component.
//!
//! Errors carry a code from the universal taxonomy, an optional data path,
//! and may chain: a cause recorded when wrapping a lower layer, and secondary
//! errors merged in when two failures coincide (e.g. a commit that persisted
//! but whose change notification failed).

use std::fmt;
use std::io;

/// Universal result codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Requested item does not exist.
    NotFound,
    /// Item already exists.
    Exists,
    /// Permission denied.
    Unauthorized,
    /// Invalid argument from the caller.
    InvalArg,
    /// Data failed schema validation.
    ValidationFailed,
    /// A blocking acquire or wait ran past its deadline.
    Timeout,
    /// A provider callback returned an error or did not answer in time.
    CallbackFailed,
    /// Underlying OS failure.
    Sys,
    /// Engine invariant violated.
    Internal,
    /// Operation not supported.
    Unsupported,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::Exists => "already exists",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InvalArg => "invalid argument",
            ErrorCode::ValidationFailed => "validation failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CallbackFailed => "callback failed",
            ErrorCode::Sys => "system error",
            ErrorCode::Internal => "internal error",
            ErrorCode::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Chainable engine error.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}{}", .path.as_deref().map(|p| format!(" ({p})")).unwrap_or_default())]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    /// Data path the error relates to, when known.
    pub path: Option<String>,
    #[source]
    pub cause: Option<Box<Error>>,
    /// Additional errors that coincided with the primary one.
    pub secondary: Vec<Error>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            cause: None,
            secondary: Vec::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Exists, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn inval_arg(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalArg, message)
    }

    pub fn validation(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message).with_path(path)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn callback(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CallbackFailed, message)
    }

    pub fn sys(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Sys, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Wrap `cause` under a new primary error.
    pub fn wrap(self, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: self.path.clone(),
            cause: Some(Box::new(self)),
            secondary: Vec::new(),
        }
    }

    /// Merge another error that coincided with this one. The primary is kept,
    /// the other becomes a secondary note for rendering.
    pub fn merge(mut self, secondary: Error) -> Self {
        self.secondary.push(secondary);
        self
    }

    /// Whether this error (or any cause) carries the given code.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        if self.code == code {
            return true;
        }
        self.cause.as_deref().is_some_and(|c| c.has_code(code))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::Unauthorized,
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            _ => ErrorCode::Sys,
        };
        Self::new(code, err.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        // Both classify as a permission failure, see design notes.
        let code = match err {
            Errno::EACCES | Errno::EPERM => ErrorCode::Unauthorized,
            Errno::ENOENT => ErrorCode::NotFound,
            Errno::EEXIST => ErrorCode::Exists,
            _ => ErrorCode::Sys,
        };
        Self::new(code, err.desc())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Sys, format!("serialization failed: {err}"))
    }
}
