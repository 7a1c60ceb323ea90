//! Pure retryability classification (§4.1). Kept separate from the cursor state machine so it
//! can be unit-tested without constructing any cursor, binding, or batch collaborator.

use crate::error::Error;

/// Returns whether `error`, observed on a connection advertising `max_wire_version`, should be
/// recovered from locally via a resume rather than surfaced to the caller.
///
/// A thin, testable re-export of [`Error::is_resumable`]; kept as a free function because the
/// classifier is conceptually a pure predicate over `(error, max_wire_version)`, not a method that
/// belongs to the error type's public API surface used by callers.
pub(crate) fn is_resumable(error: &Error, max_wire_version: i32) -> bool {
    error.is_resumable(max_wire_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandError, ErrorKind};

    #[test]
    fn delegates_to_error_classifier() {
        let err = Error::new(ErrorKind::Command(CommandError {
            code: 43,
            code_name: "CursorNotFound".into(),
            message: "cursor not found".into(),
        }));
        assert!(is_resumable(&err, 6));
    }
}
