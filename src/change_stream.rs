//! Contains the functionality for resumable change streams.

pub mod collaborators;
pub mod cursor;
pub mod event;
mod lifecycle;
pub mod operation;
pub mod options;
mod retry;
mod token_store;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::{
    change_stream::{cursor::ResumableCursor, event::ResumeToken},
    error::Result,
};

pub use crate::error::is_resumable;

/// A `ChangeStream` streams the ongoing changes of its associated collection, database or
/// deployment.
///
/// `ChangeStream`s are "resumable": they are automatically restarted at the last-seen resume
/// token when the underlying cursor encounters a
/// [resumable error](https://github.com/mongodb/specifications/blob/master/source/change-streams/change-streams.rst#resumable-error).
/// This is implemented by [`ResumableCursor`]; this type is a thin, user-facing handle over it.
#[derive(Debug)]
pub struct ChangeStream<T> {
    cursor: Arc<ResumableCursor<T>>,
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(cursor: ResumableCursor<T>) -> Self {
        Self {
            cursor: Arc::new(cursor),
        }
    }

    /// Returns the cached resume token that can be used to resume after the most recently
    /// returned change.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.cursor.resume_token()
    }

    /// Returns the `postBatchResumeToken` carried by the most recently fetched batch, if the
    /// server provided one. Distinct from [`resume_token`](Self::resume_token), which returns the
    /// stream's folded resume position regardless of how it was last advanced.
    pub fn get_post_batch_resume_token(&self) -> Option<ResumeToken> {
        self.cursor.get_post_batch_resume_token()
    }

    /// The batch size used for subsequent fetches, if one has been configured.
    pub fn batch_size(&self) -> Option<u32> {
        self.cursor.batch_size()
    }

    /// Sets the batch size used for subsequent fetches. Takes effect on the next
    /// `next()`/`try_next()` call.
    pub fn set_batch_size(&self, size: u32) {
        self.cursor.set_batch_size(size)
    }

    /// Returns whether the change stream will continue to receive events.
    pub fn is_alive(&self) -> bool {
        !self.cursor.is_closed()
    }

    /// Fetches the next non-empty batch, suspending until the server reports new events.
    pub async fn next(&self) -> Result<Vec<T>> {
        self.cursor.next().await
    }

    /// Fetches whatever batch is immediately available, possibly empty.
    pub async fn try_next(&self) -> Result<Vec<T>> {
        self.cursor.try_next().await
    }

    /// Idempotently closes the change stream, releasing the underlying connection.
    pub async fn close(&self) {
        self.cursor.close().await
    }

    /// Returns a clone of this handle sharing the same underlying cursor; used to call `close()`
    /// concurrently with an in-flight `next()`/`try_next()` from another task.
    pub fn handle(&self) -> Self {
        Self {
            cursor: Arc::clone(&self.cursor),
        }
    }

    /// Retypes this stream so future batches decode as `D` instead of `T`.
    ///
    /// Requires that no other [`handle`](Self::handle) clone is outstanding, since retyping needs
    /// sole ownership of the underlying cursor; panics otherwise.
    pub fn with_type<D>(self) -> ChangeStream<D>
    where
        D: DeserializeOwned + Send + Sync + 'static,
    {
        let cursor = Arc::try_unwrap(self.cursor)
            .unwrap_or_else(|_| panic!("with_type called while another handle is outstanding"));
        ChangeStream {
            cursor: Arc::new(cursor.with_type()),
        }
    }
}
