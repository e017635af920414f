//! Error taxonomy for remote operations and the stderr classification table.
//!
//! `sftp` and `ssh` only report failures as human-readable text, so every
//! failing command goes through [`classify_stderr`] exactly once. The tables
//! below are the only place that knows which substrings mean what.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialisable discriminant of a [`RemoteError`], used by the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    ConnectionTimeout,
    PathNotFound,
    PermissionDenied,
    ConnectionLost,
    Operation,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    ConnectionTimeout(String),

    #[error("{0}")]
    PathNotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    ConnectionLost(String),

    /// Catch-all for failures that have no dedicated recovery path.
    #[error("{0}")]
    Operation(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Authentication(_) => ErrorKind::Authentication,
            RemoteError::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            RemoteError::PathNotFound(_) => ErrorKind::PathNotFound,
            RemoteError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RemoteError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            RemoteError::Operation(_) => ErrorKind::Operation,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::Authentication(m)
            | RemoteError::ConnectionTimeout(m)
            | RemoteError::PathNotFound(m)
            | RemoteError::PermissionDenied(m)
            | RemoteError::ConnectionLost(m)
            | RemoteError::Operation(m) => m,
        }
    }

    /// Rebuild an error from its cached descriptor.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Authentication => RemoteError::Authentication(message),
            ErrorKind::ConnectionTimeout => RemoteError::ConnectionTimeout(message),
            ErrorKind::PathNotFound => RemoteError::PathNotFound(message),
            ErrorKind::PermissionDenied => RemoteError::PermissionDenied(message),
            ErrorKind::ConnectionLost => RemoteError::ConnectionLost(message),
            ErrorKind::Operation => RemoteError::Operation(message),
        }
    }

    /// Failures worth remembering in the negative cache. A missing path or a
    /// permission problem will not fix itself within seconds; anything else
    /// might be transient.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            RemoteError::PathNotFound(_) | RemoteError::PermissionDenied(_)
        )
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        RemoteError::Operation(format!("{}: {}", context, err))
    }
}

/// One row of a classification table.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPattern {
    /// Lowercase substring searched for in stderr.
    pub needle: &'static str,
    pub kind: ErrorKind,
    /// Message prefix; the subject (host or path) is appended verbatim.
    pub reason: &'static str,
}

const fn pattern(needle: &'static str, kind: ErrorKind, reason: &'static str) -> ErrorPattern {
    ErrorPattern { needle, kind, reason }
}

/// Failures while establishing the control master or the first `pwd`.
pub const CONNECT_ERRORS: &[ErrorPattern] = &[
    pattern("permission denied", ErrorKind::Authentication, "SSH authentication failed for "),
    pattern("authentication failed", ErrorKind::Authentication, "SSH authentication failed for "),
    pattern("timed out", ErrorKind::ConnectionTimeout, "Connection timeout to "),
    pattern("connection refused", ErrorKind::ConnectionTimeout, "Connection timeout to "),
];

/// Failures of commands that address an existing remote path
/// (`ls`, `get`, `rm`, `rmdir`, `mkdir`, `rename`).
pub const PATH_ERRORS: &[ErrorPattern] = &[
    pattern("no such file", ErrorKind::PathNotFound, "Remote path not found: "),
    pattern("not found", ErrorKind::PathNotFound, "Remote path not found: "),
    pattern("permission denied", ErrorKind::PermissionDenied, "Permission denied accessing: "),
    pattern("not empty", ErrorKind::Operation, "Directory not empty: "),
];

/// Failures of uploads. A full disk is reported as a plain operation error:
/// the caller recovers the same way as from any other failed write.
pub const WRITE_ERRORS: &[ErrorPattern] = &[
    pattern("permission denied", ErrorKind::PermissionDenied, "Permission denied writing to "),
    pattern("no space", ErrorKind::Operation, "Disk full on remote system: "),
    pattern("disk full", ErrorKind::Operation, "Disk full on remote system: "),
];

/// Map the stderr of a failed command onto a typed error.
///
/// `action` and `subject` only shape the fallback message
/// (`"Failed to <action> <subject>: <stderr>"`).
pub fn classify_stderr(
    stderr: &str,
    table: &[ErrorPattern],
    action: &str,
    subject: &str,
) -> RemoteError {
    let lowered = stderr.to_lowercase();
    for row in table {
        if lowered.contains(row.needle) {
            return RemoteError::from_kind(row.kind, format!("{}{}", row.reason, subject));
        }
    }
    RemoteError::Operation(format!("Failed to {} {}: {}", action, subject, stderr.trim()))
}
