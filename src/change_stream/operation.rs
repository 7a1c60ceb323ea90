//! The Change-Stream Operation Descriptor (§4.2): the immutable identity of the aggregation plus
//! the mutable resume parameters only the resumable cursor is allowed to update.

use async_trait::async_trait;
use bson::{Document, Timestamp};
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Mutex};

use crate::{
    change_stream::{
        collaborators::{Binding, FreshCursor},
        event::{RawEvent, ResumeToken},
        options::ChangeStreamOptions,
    },
    error::Result,
};

/// Identifies the target of a change-stream aggregation: a single collection, a whole database,
/// or an entire deployment.
#[derive(Debug, Clone)]
pub enum AggregateTarget {
    /// Watch a single collection.
    Collection {
        /// The database the collection lives in.
        db: String,
        /// The collection name.
        coll: String,
    },
    /// Watch every collection in a database.
    Database(String),
    /// Watch every database in the deployment.
    Cluster,
}

/// The mutable half of a change-stream operation's identity: the parameters that change on every
/// resume. Only the resumable cursor calls [`OperationDescriptor::set_resume_parameters`].
#[derive(Debug, Clone, Default)]
pub(crate) struct ResumeParameters {
    pub(crate) resume_token: Option<ResumeToken>,
    pub(crate) max_wire_version: i32,
}

/// Describes how to (re-)open a change-stream aggregation and how to decode the raw events it
/// produces.
///
/// Implementations of `execute` are expected to prefer, in order: an explicit `start_after`,
/// then the cached resume token (via `resume_after`), then `start_at_operation_time`, and must
/// never silently downgrade a user-specified start-at to a resume-after on the very first
/// execution (§4.2).
#[async_trait]
pub trait OperationDescriptor<T>: Send + Sync
where
    T: DeserializeOwned,
{
    /// Opens a fresh server-side change stream using the current resume parameters.
    async fn execute(&self, binding: &dyn Binding) -> Result<FreshCursor>;

    /// Updates the resume parameters used by the next `execute` call. Must only be called by the
    /// resumable cursor, and only between a resumable failure and the subsequent re-execution.
    fn set_resume_parameters(&self, token: Option<ResumeToken>, max_wire_version: i32);

    /// Decodes a raw event into the caller's type.
    fn decode(&self, raw: &RawEvent) -> Result<T> {
        raw.decode()
    }

    /// The logical clock pin captured when the stream was first opened, if any.
    fn start_at_operation_time(&self) -> Option<Timestamp>;
}

/// A concrete operation descriptor backed by an injected executor, grounded on the reference
/// driver's `Aggregate` operation and `WatchArgs`.
///
/// `Executor` is the seam onto the out-of-scope wire protocol / command executor (§1): this type
/// supplies the change-stream-specific option and pipeline bookkeeping, and delegates the actual
/// command round-trip to whatever executor is injected.
pub struct ChangeStreamOperation<Exec> {
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    operation_time: Option<Timestamp>,
    resume_params: Mutex<ResumeParameters>,
    executor: Exec,
}

/// The out-of-scope command executor: given a target, pipeline, options and resume parameters,
/// opens a change stream and returns the fresh cursor. The wire encoding, authentication, and
/// server selection behind this call are external collaborators (§1) this crate does not
/// implement.
#[async_trait]
pub trait ChangeStreamExecutor: Send + Sync {
    /// Executes the aggregation described by the given pieces, returning the new cursor.
    async fn execute(
        &self,
        binding: &dyn Binding,
        target: &AggregateTarget,
        pipeline: &[Document],
        options: &ChangeStreamOptions,
        resume_params: &ResumeParameters,
    ) -> Result<FreshCursor>;
}

impl<Exec> ChangeStreamOperation<Exec>
where
    Exec: ChangeStreamExecutor,
{
    /// Constructs a new descriptor. `initial_operation_time` is the `operationTime` returned by
    /// the very first `aggregate` that opened the stream, used to answer
    /// [`OperationDescriptor::start_at_operation_time`].
    pub fn new(
        target: AggregateTarget,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        initial_operation_time: Option<Timestamp>,
        executor: Exec,
    ) -> Self {
        let resume_params = ResumeParameters {
            resume_token: options.resume_after.clone().or_else(|| options.start_after.clone()),
            max_wire_version: 0,
        };
        Self {
            target,
            pipeline,
            options,
            operation_time: initial_operation_time,
            resume_params: Mutex::new(resume_params),
            executor,
        }
    }
}

#[async_trait]
impl<T, Exec> OperationDescriptor<T> for ChangeStreamOperation<Exec>
where
    T: DeserializeOwned,
    Exec: ChangeStreamExecutor,
{
    async fn execute(&self, binding: &dyn Binding) -> Result<FreshCursor> {
        let params = self.resume_params.lock().unwrap().clone();
        self.executor
            .execute(binding, &self.target, &self.pipeline, &self.options, &params)
            .await
    }

    fn set_resume_parameters(&self, token: Option<ResumeToken>, max_wire_version: i32) {
        let mut params = self.resume_params.lock().unwrap();
        params.resume_token = token;
        params.max_wire_version = max_wire_version;
    }

    fn start_at_operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }
}

/// Adapts an `OperationDescriptor<T>` into an `OperationDescriptor<D>` without touching its
/// execution identity, used by [`ResumableCursor::with_type`](crate::change_stream::cursor::ResumableCursor::with_type)
/// to retype a stream in place. `execute`/`set_resume_parameters`/`start_at_operation_time` never
/// depend on the decoded type, so they delegate straight through; only `decode`'s default
/// implementation picks up `D` via this impl's own type parameter.
pub(crate) struct RetypedDescriptor<T, D> {
    inner: Box<dyn OperationDescriptor<T>>,
    _marker: PhantomData<fn() -> D>,
}

impl<T, D> RetypedDescriptor<T, D> {
    pub(crate) fn new(inner: Box<dyn OperationDescriptor<T>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, D> OperationDescriptor<D> for RetypedDescriptor<T, D>
where
    T: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
{
    async fn execute(&self, binding: &dyn Binding) -> Result<FreshCursor> {
        self.inner.execute(binding).await
    }

    fn set_resume_parameters(&self, token: Option<ResumeToken>, max_wire_version: i32) {
        self.inner.set_resume_parameters(token, max_wire_version)
    }

    fn start_at_operation_time(&self) -> Option<Timestamp> {
        self.inner.start_at_operation_time()
    }
}
