//! External collaborator interfaces (§6). Everything in this module is consumed, not implemented,
//! by the resumable cursor: the wire protocol, the connection pool, and the command executor live
//! outside this crate's scope and are represented here only by the traits the orchestrator needs.

use async_trait::async_trait;

use crate::{
    change_stream::event::{RawEvent, ResumeToken},
    error::Result,
};

/// An ordered finite sequence of raw events plus an optional post-batch resume token.
///
/// Either field may be empty/absent independently; both being empty is the normal "no new
/// events, no position update" outcome of a `try_next`.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// The raw events in this batch, in server order.
    pub events: Vec<RawEvent>,
    /// The server-reported resume token for the end of this batch, if any. Takes precedence over
    /// the last event's `_id` per invariant I2.
    pub post_batch_resume_token: Option<ResumeToken>,
}

/// A handle to an acquired read connection scope, reference-counted by the underlying connection
/// pool/session layer.
///
/// The resumable cursor owns exactly one retain/release pair for its own lifetime and balances
/// every additional temporary retain it takes during a resume (§5).
#[async_trait]
pub trait Binding: Send + Sync {
    /// Returns a newly retained handle to the same binding.
    fn retain(&self) -> Box<dyn Binding>;

    /// Releases this handle. Must be called exactly once per handle obtained from `retain` (or
    /// from the binding's original owner).
    async fn release(self: Box<Self>);

    /// Acquires a connection suitable for reading the server's current wire version, used only to
    /// seed the resume parameters before re-executing the operation.
    async fn acquire_read_connection(&self) -> Result<Box<dyn ConnectionSource>>;
}

/// A connection acquired from a [`Binding`], used to observe server capabilities before it is
/// released back to the pool.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// The max wire version advertised by the server this connection is attached to.
    fn max_wire_version(&self) -> i32;

    /// Releases this connection source back to the pool.
    async fn release(self: Box<Self>);
}

/// Produces successive batches of opaque raw events from a single server-side cursor.
///
/// Owned exclusively by at most one resumable cursor at a time; replaced wholesale on resume.
#[async_trait]
pub trait BatchCursor: Send {
    /// Fetches the next non-empty batch, suspending until the server has events available (or
    /// signals end of stream).
    async fn next_batch(&mut self) -> Result<Batch>;

    /// Fetches whatever is immediately available; may return an empty batch.
    async fn try_next_batch(&mut self) -> Result<Batch>;

    /// Closes the underlying server-side cursor. Idempotent.
    async fn close(&mut self);

    /// Sets the batch size used for subsequent fetches.
    fn set_batch_size(&mut self, size: u32);

    /// Returns the currently configured batch size, if any.
    fn batch_size(&self) -> Option<u32>;

    /// Returns the resume token attached to the most recently fetched batch, if the server
    /// provided one.
    fn post_batch_resume_token(&self) -> Option<&ResumeToken>;

    /// Whether the very first batch fetched from this cursor was empty.
    fn first_batch_empty(&self) -> bool;

    /// The max wire version of the connection this cursor was opened on.
    fn max_wire_version(&self) -> i32;

    /// Whether this cursor has already been closed (by the server or by a prior `close()` call).
    fn is_closed(&self) -> bool;
}

/// The result of re-executing a change-stream aggregation during a resume: a freshly opened
/// underlying cursor, plus the binding retained for its lifetime.
///
/// Modeled after the reference driver's resume path, which reconstructs an entire new
/// `ChangeStream` wrapper (itself holding a retained binding) and then steals its cursor — see
/// the design notes in SPEC_FULL.md §9.
pub struct FreshCursor {
    /// The newly opened underlying cursor.
    pub underlying: Box<dyn BatchCursor>,
    /// The binding retained for the lifetime of `underlying`. Released by the caller immediately
    /// after `underlying` is stolen.
    pub binding: Box<dyn Binding>,
}
