//! Contains the `Error` and `Result` types used throughout this crate.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

/// The result type for all methods in this crate that can fail.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire version at or above which the server's `"ResumableChangeStreamError"` label is trusted.
pub const RESUMABLE_LABEL_WIRE_VERSION: i32 = 9;

/// Server codes that denote a retryable loss of cursor context on wire versions that predate
/// the `"ResumableChangeStreamError"` label (mirrors the equivalent table in the reference
/// driver's `Error::is_resumable`).
pub const RETRYABLE_CHANGE_STREAM_CODES: [i32; 17] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436, 63, 150, 13388, 234, 133,
];

/// A server code meaning "cursor not found"; always resumable regardless of wire version.
pub const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// Label the server attaches to a command error to mark it resumable.
pub const RESUMABLE_CHANGE_STREAM_ERROR_LABEL: &str = "ResumableChangeStreamError";

/// An error that can occur while operating a resumable change-stream cursor.
///
/// Cloneable (the inner [`ErrorKind`] is boxed) so that a single failure can be observed both by
/// the caller and by any diagnostics code without consuming it.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            labels: HashSet::new(),
            wire_version: None,
            source: None,
        }
    }

    /// Attaches a server error label (e.g. `"ResumableChangeStreamError"`) to this error.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Attaches the wire version of the connection that produced this error.
    pub fn with_wire_version(mut self, wire_version: i32) -> Self {
        self.wire_version = Some(wire_version);
        self
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error carries the given label.
    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The command error code carried by this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => Some(c.code),
            _ => None,
        }
    }

    fn is_server_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io { .. } | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    /// Whether this error is resumable as per the change-stream resume protocol (§4.1).
    ///
    /// A pure function of the error and the max wire version observed on the connection that
    /// produced it; never consults any mutable cursor state.
    pub fn is_resumable(&self, max_wire_version: i32) -> bool {
        if matches!(
            self.kind.as_ref(),
            ErrorKind::MissingResumeToken
                | ErrorKind::CursorClosed { .. }
                | ErrorKind::Authorization { .. }
                | ErrorKind::InvalidArgument { .. }
                | ErrorKind::Decode { .. }
        ) {
            return false;
        }

        if self.is_network_error() {
            return true;
        }

        if !self.is_server_error() {
            return false;
        }

        let code = self.code();
        if code == Some(CURSOR_NOT_FOUND_CODE) {
            return true;
        }

        if max_wire_version >= RESUMABLE_LABEL_WIRE_VERSION
            && self.contains_label(RESUMABLE_CHANGE_STREAM_ERROR_LABEL)
        {
            return true;
        }

        if max_wire_version < RESUMABLE_LABEL_WIRE_VERSION {
            if let Some(code) = code {
                return RETRYABLE_CHANGE_STREAM_CODES.contains(&code);
            }
        }

        false
    }
}

/// Standalone form of [`Error::is_resumable`], exposed as a free function so the classifier can
/// be unit-tested and called without constructing an `Error` receiver first.
pub fn is_resumable(error: &Error, max_wire_version: i32) -> bool {
    error.is_resumable(max_wire_version)
}

/// The kind of error that occurred.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided (e.g. both `resume_after` and `start_after` set).
    #[error("An invalid argument was provided: {message}")]
    InvalidArgument {
        /// Human-readable description.
        message: String,
    },

    /// The server rejected the operation for lack of authorization.
    #[error("{message}")]
    Authorization {
        /// Human-readable description.
        message: String,
    },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// Wrapper around an I/O error observed while fetching a batch.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool was cleared during operation execution due to a concurrent error.
    #[error("{message}")]
    ConnectionPoolCleared {
        /// Human-readable description.
        message: String,
    },

    /// No resume token was present on a change-stream document (I5).
    #[error("Cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    /// A method was called on a cursor after `close()` had already completed.
    #[error("{operation} was called after close()")]
    CursorClosed {
        /// The operation that was attempted (`"next()"` or `"try_next()"`).
        operation: &'static str,
    },

    /// The decoder failed to parse a raw document into the caller's event type.
    #[error("Failed to decode change stream event: {message}")]
    Decode {
        /// Human-readable description.
        message: String,
    },

    /// An internal invariant was violated (e.g. a resumed operation returned an already-closed
    /// cursor).
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable description.
        message: String,
    },
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Error::new(ErrorKind::Decode {
            message: e.to_string(),
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(Arc::new(e)))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// An error returned by the server in response to a command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandError {
    /// The server's numeric error code.
    pub code: i32,
    /// The name associated with the error code.
    pub code_name: String,
    /// A description of the error.
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(code: {}, codeName: {}) {}",
            self.code, self.code_name, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_err(code: i32) -> Error {
        Error::new(ErrorKind::Command(CommandError {
            code,
            code_name: "Test".into(),
            message: "boom".into(),
        }))
    }

    #[test]
    fn network_errors_are_always_resumable() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "x"));
        assert!(err.is_resumable(0));
        assert!(err.is_resumable(20));
    }

    #[test]
    fn cursor_not_found_is_always_resumable() {
        let err = command_err(43);
        assert!(err.is_resumable(0));
        assert!(err.is_resumable(20));
    }

    #[test]
    fn labelled_error_resumable_only_at_or_above_threshold() {
        let err = command_err(280).with_label(RESUMABLE_CHANGE_STREAM_ERROR_LABEL);
        assert!(err.is_resumable(9));
        assert!(err.is_resumable(20));
        assert!(!err.is_resumable(8));
    }

    #[test]
    fn legacy_retryable_code_only_below_threshold() {
        let err = command_err(91);
        assert!(err.is_resumable(8));
        assert!(!err.is_resumable(9));
    }

    #[test]
    fn missing_resume_token_is_never_resumable() {
        let err = Error::new(ErrorKind::MissingResumeToken);
        assert!(!err.is_resumable(20));
    }

    #[test]
    fn cursor_closed_is_never_resumable() {
        let err = Error::new(ErrorKind::CursorClosed { operation: "next()" });
        assert!(!err.is_resumable(20));
    }

    #[test]
    fn unrelated_command_error_is_not_resumable() {
        let err = command_err(11);
        assert!(!err.is_resumable(20));
    }
}
