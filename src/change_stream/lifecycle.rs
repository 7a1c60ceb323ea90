//! The Cursor Lifecycle Guard (§4.5): concurrency discipline for close-while-busy, implemented as
//! three booleans under one monitor.

use std::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Default, Clone, Copy)]
struct LifecycleState {
    closed: bool,
    operation_in_progress: bool,
    close_pending: bool,
}

/// Guards the `(closed, operation_in_progress, close_pending)` triple per the transition table in
/// §4.5. All transitions are synchronous critical sections; no `.await` ever happens while the
/// monitor is held, so a plain [`std::sync::Mutex`] is sufficient.
#[derive(Debug, Default)]
pub(crate) struct LifecycleGuard {
    state: Mutex<LifecycleState>,
}

impl LifecycleGuard {
    /// (F,F,F) -> (F,T,F). Rejects with [`ErrorKind::CursorClosed`] if already closed.
    pub(crate) fn begin_fetch(&self, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::new(ErrorKind::CursorClosed { operation }));
        }
        debug_assert!(!state.operation_in_progress, "I3: no two fetches in flight");
        state.operation_in_progress = true;
        Ok(())
    }

    /// Marks the in-flight fetch as complete. Returns `true` if a deferred close must now be
    /// performed by the caller ((F,T,T) -> (T,F,F)), `false` otherwise ((F,T,F) -> (F,F,F)).
    pub(crate) fn end_fetch(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.operation_in_progress = false;
        if state.close_pending {
            state.close_pending = false;
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Requests a close. Returns `true` if the caller must perform the close now (no fetch was in
    /// progress), `false` if it was deferred to (or already past) a fetch in progress.
    pub(crate) fn request_close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        if state.operation_in_progress {
            state.close_pending = true;
            false
        } else {
            state.closed = true;
            true
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_then_close_runs_immediately_when_idle() {
        let guard = LifecycleGuard::default();
        assert!(guard.request_close());
        assert!(guard.is_closed());
    }

    #[test]
    fn close_during_fetch_is_deferred_then_runs_on_completion() {
        let guard = LifecycleGuard::default();
        guard.begin_fetch("next()").unwrap();
        assert!(!guard.request_close(), "close must defer while a fetch is in flight");
        assert!(!guard.is_closed());
        assert!(guard.end_fetch(), "deferred close must run once the fetch completes");
        assert!(guard.is_closed());
    }

    #[test]
    fn fetch_without_pending_close_does_not_close() {
        let guard = LifecycleGuard::default();
        guard.begin_fetch("next()").unwrap();
        assert!(!guard.end_fetch());
        assert!(!guard.is_closed());
    }

    #[test]
    fn fetch_after_closed_is_rejected() {
        let guard = LifecycleGuard::default();
        assert!(guard.request_close());
        let err = guard.begin_fetch("next()").unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::CursorClosed { operation: "next()" }));
    }

    #[test]
    fn close_is_idempotent() {
        let guard = LifecycleGuard::default();
        assert!(guard.request_close());
        assert!(!guard.request_close());
        assert!(guard.is_closed());
    }
}
