//! The Resumable Cursor (§4, §5): the orchestrator that presents a continuous ordered stream of
//! events over an underlying server-side cursor, transparently resuming it after resumable
//! failures.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Mutex,
};

use bson::Timestamp;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::{
    change_stream::{
        collaborators::{Batch, BatchCursor, Binding},
        event::{RawEvent, ResumeToken},
        lifecycle::LifecycleGuard,
        operation::{OperationDescriptor, RetypedDescriptor},
        retry,
        token_store::ResumeTokenStore,
    },
    error::{Error, ErrorKind, Result},
};

/// Orchestrates a single resumable change-stream cursor (§4, §5).
///
/// Holds the underlying server-side cursor, the connection binding that keeps it alive, the
/// operation descriptor used to re-execute on resume, and the tracked resume position. Every
/// public method is safe to call concurrently with `close()` from another task; see
/// [`LifecycleGuard`] for the discipline that makes this so.
pub struct ResumableCursor<T> {
    guard: LifecycleGuard,
    underlying: tokio::sync::Mutex<Box<dyn BatchCursor>>,
    descriptor: Box<dyn OperationDescriptor<T>>,
    binding: Mutex<Option<Box<dyn Binding>>>,
    token_store: ResumeTokenStore,
    operation_time: Mutex<Option<Timestamp>>,
    first_batch_empty: AtomicBool,
    max_wire_version: AtomicI32,
    batch_size: Mutex<Option<u32>>,
    post_batch_resume_token: Mutex<Option<ResumeToken>>,
}

impl<T> std::fmt::Debug for ResumableCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableCursor")
            .field("closed", &self.guard.is_closed())
            .field("resume_token", &self.token_store.current())
            .field("max_wire_version", &self.max_wire_version())
            .field("batch_size", &self.batch_size())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchMode {
    Next,
    TryNext,
}

impl FetchMode {
    fn operation_name(self) -> &'static str {
        match self {
            FetchMode::Next => "next()",
            FetchMode::TryNext => "try_next()",
        }
    }
}

impl<T> ResumableCursor<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Constructs a resumable cursor around a freshly opened underlying cursor, the binding that
    /// keeps it alive, and the descriptor used to re-execute the aggregation on resume.
    pub fn new(
        underlying: Box<dyn BatchCursor>,
        binding: Box<dyn Binding>,
        descriptor: Box<dyn OperationDescriptor<T>>,
        initial_resume_token: Option<ResumeToken>,
    ) -> Self {
        let max_wire_version = underlying.max_wire_version();
        let first_batch_empty = underlying.first_batch_empty();
        let batch_size = underlying.batch_size();
        Self {
            guard: LifecycleGuard::default(),
            underlying: tokio::sync::Mutex::new(underlying),
            descriptor,
            binding: Mutex::new(Some(binding)),
            token_store: ResumeTokenStore::new(initial_resume_token),
            operation_time: Mutex::new(None),
            first_batch_empty: AtomicBool::new(first_batch_empty),
            max_wire_version: AtomicI32::new(max_wire_version),
            batch_size: Mutex::new(batch_size),
            post_batch_resume_token: Mutex::new(None),
        }
    }

    /// Retypes this cursor so future batches decode as `D` instead of `T`. Consumes `self`
    /// since the underlying cursor, binding, and resume state carry over unchanged; only the
    /// decode target changes.
    pub fn with_type<D>(self) -> ResumableCursor<D>
    where
        D: DeserializeOwned + Send + Sync + 'static,
    {
        ResumableCursor {
            guard: self.guard,
            underlying: self.underlying,
            descriptor: Box::new(RetypedDescriptor::new(self.descriptor)),
            binding: self.binding,
            token_store: self.token_store,
            operation_time: self.operation_time,
            first_batch_empty: self.first_batch_empty,
            max_wire_version: self.max_wire_version,
            batch_size: self.batch_size,
            post_batch_resume_token: self.post_batch_resume_token,
        }
    }

    /// The cached resume token, if any.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.token_store.current()
    }

    /// Whether the very first batch ever fetched on this stream's lineage was empty.
    pub fn is_first_batch_empty(&self) -> bool {
        self.first_batch_empty.load(Ordering::Acquire)
    }

    /// The max wire version observed on the connection currently backing this cursor.
    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version.load(Ordering::Acquire)
    }

    /// The operation time pinned at stream open, if `start_at_operation_time` was used.
    pub fn operation_time(&self) -> Option<Timestamp> {
        *self.operation_time.lock().unwrap()
    }

    /// The batch size used for subsequent fetches, if one has been configured.
    pub fn batch_size(&self) -> Option<u32> {
        *self.batch_size.lock().unwrap()
    }

    /// Sets the batch size used for subsequent fetches.
    ///
    /// Takes effect on the next `next()`/`try_next()` call; held in a `std::sync::Mutex` rather
    /// than applied straight through to the underlying cursor so that callers never need to
    /// `.await` a connection lock just to record a preference (§4.4, §6).
    pub fn set_batch_size(&self, size: u32) {
        *self.batch_size.lock().unwrap() = Some(size);
    }

    /// The `postBatchResumeToken` carried by the most recently fetched batch, if the server
    /// provided one. Distinct from [`resume_token`](Self::resume_token), which returns the
    /// cursor's folded resume position regardless of how it was last advanced (§4.4, §6).
    pub fn get_post_batch_resume_token(&self) -> Option<ResumeToken> {
        self.post_batch_resume_token.lock().unwrap().clone()
    }

    /// Whether this cursor has been closed.
    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Fetches the next non-empty batch, transparently resuming the underlying cursor across any
    /// number of resumable failures.
    pub async fn next(&self) -> Result<Vec<T>> {
        self.fetch(FetchMode::Next).await
    }

    /// Fetches whatever is immediately available, possibly empty.
    pub async fn try_next(&self) -> Result<Vec<T>> {
        self.fetch(FetchMode::TryNext).await
    }

    /// Idempotently closes this cursor, releasing the underlying connection. If a fetch is
    /// currently in flight, the close is deferred until it completes (§4.5).
    pub async fn close(&self) {
        if self.guard.request_close() {
            self.perform_close().await;
        }
    }

    /// Synchronously retains the binding, returning an owned handle without holding the guard
    /// across an `.await` point.
    ///
    /// [`std::sync::MutexGuard`] is not `Send`, so it cannot be held across an `.await`; this
    /// helper confines the lock to the synchronous `retain()` call and returns the owned result.
    fn retain_binding(&self) -> Result<Box<dyn Binding>> {
        let guard = self.binding.lock().unwrap();
        match guard.as_deref() {
            Some(binding) => Ok(binding.retain()),
            None => Err(Error::new(ErrorKind::Internal {
                message: "binding retained after it was released".into(),
            })),
        }
    }

    async fn fetch(&self, mode: FetchMode) -> Result<Vec<T>> {
        self.guard.begin_fetch(mode.operation_name())?;
        let result = self.fetch_inner(mode).await;
        if self.guard.end_fetch() {
            self.perform_close().await;
        }
        result
    }

    async fn fetch_inner(&self, mode: FetchMode) -> Result<Vec<T>> {
        loop {
            let attempt = {
                let mut underlying = self.underlying.lock().await;
                if let Some(size) = self.batch_size() {
                    underlying.set_batch_size(size);
                }
                match mode {
                    FetchMode::Next => underlying.next_batch().await,
                    FetchMode::TryNext => underlying.try_next_batch().await,
                }
            };

            match attempt {
                Ok(batch) => return self.apply_batch(batch),
                Err(err) => {
                    let max_wire_version = self.max_wire_version();
                    if !retry::is_resumable(&err, max_wire_version) {
                        return Err(err);
                    }
                    warn!(error = %err, "resumable error observed while fetching batch; resuming");
                    self.resume().await?;
                }
            }
        }
    }

    /// Applies a successfully fetched batch: validates every event carries `_id` (I5) before
    /// advancing the token, then decodes (§4.3, §4.4).
    fn apply_batch(&self, batch: Batch) -> Result<Vec<T>> {
        for event in &batch.events {
            event.id()?;
        }

        self.token_store.update_from_batch(&batch);
        *self.post_batch_resume_token.lock().unwrap() = batch.post_batch_resume_token.clone();

        batch
            .events
            .iter()
            .map(|event| self.descriptor.decode(event))
            .collect()
    }

    /// Re-executes the change-stream aggregation after a resumable failure (§5), replacing the
    /// underlying cursor and binding in place.
    ///
    /// Takes two independently retained-and-released binding handles (one to probe the server's
    /// wire version, one to hold across the re-execute call) in addition to releasing this
    /// cursor's own retention of the freshly returned binding once the underlying cursor has been
    /// stolen out of it. This is a stricter, fully balanced reading of the single extra retain
    /// the informal resume description mentions; see the design notes for why.
    async fn resume(&self) -> Result<()> {
        {
            let mut underlying = self.underlying.lock().await;
            underlying.close().await;
        }

        let probe_binding = self.retain_binding()?;
        let connection = probe_binding.acquire_read_connection().await?;
        let max_wire_version = connection.max_wire_version();
        connection.release().await;
        probe_binding.release().await;

        self.max_wire_version.store(max_wire_version, Ordering::Release);
        self.descriptor
            .set_resume_parameters(self.token_store.current(), max_wire_version);

        let exec_binding = self.retain_binding()?;
        let fresh = self.descriptor.execute(exec_binding.as_ref()).await;
        exec_binding.release().await;
        let fresh = fresh?;

        if fresh.underlying.is_closed() {
            fresh.binding.release().await;
            return Err(Error::new(ErrorKind::Internal {
                message: "resumed operation returned an already-closed cursor".into(),
            }));
        }

        debug!("change stream resumed successfully");

        self.max_wire_version
            .store(fresh.underlying.max_wire_version(), Ordering::Release);

        {
            let mut underlying = self.underlying.lock().await;
            *underlying = fresh.underlying;
            if let Some(size) = self.batch_size() {
                underlying.set_batch_size(size);
            }
        }

        fresh.binding.release().await;

        Ok(())
    }

    /// Releases the underlying cursor and binding. Idempotent at the call site via
    /// [`LifecycleGuard`]; this method itself assumes it is called at most once.
    async fn perform_close(&self) {
        trace!("closing resumable cursor");
        {
            let mut underlying = self.underlying.lock().await;
            underlying.close().await;
        }
        if let Some(binding) = self.binding.lock().unwrap().take() {
            binding.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_stream::collaborators::FreshCursor;
    use async_trait::async_trait;
    use bson::{doc, RawDocumentBuf};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    };

    #[derive(Debug, Deserialize, PartialEq, Eq)]
    struct Doc {
        x: i32,
    }

    fn raw_event(id: i32, x: i32) -> RawEvent {
        let mut bytes = Vec::new();
        doc! { "_id": { "t": id }, "x": x }.to_writer(&mut bytes).unwrap();
        RawEvent::new(RawDocumentBuf::from_bytes(bytes).unwrap())
    }

    fn raw_event_missing_id(x: i32) -> RawEvent {
        let mut bytes = Vec::new();
        doc! { "x": x }.to_writer(&mut bytes).unwrap();
        RawEvent::new(RawDocumentBuf::from_bytes(bytes).unwrap())
    }

    fn token(t: i32) -> ResumeToken {
        ResumeToken::from_bson(bson::Bson::Document(doc! { "t": t }))
    }

    struct FakeConnection {
        max_wire_version: i32,
    }

    #[async_trait]
    impl crate::change_stream::collaborators::ConnectionSource for FakeConnection {
        fn max_wire_version(&self) -> i32 {
            self.max_wire_version
        }
        async fn release(self: Box<Self>) {}
    }

    struct FakeBinding {
        release_count: Arc<AtomicUsize>,
        max_wire_version: i32,
    }

    #[async_trait]
    impl Binding for FakeBinding {
        fn retain(&self) -> Box<dyn Binding> {
            Box::new(FakeBinding {
                release_count: Arc::clone(&self.release_count),
                max_wire_version: self.max_wire_version,
            })
        }

        async fn release(self: Box<Self>) {
            self.release_count.fetch_add(1, AtomicOrdering::SeqCst);
        }

        async fn acquire_read_connection(
            &self,
        ) -> Result<Box<dyn crate::change_stream::collaborators::ConnectionSource>> {
            Ok(Box::new(FakeConnection {
                max_wire_version: self.max_wire_version,
            }))
        }
    }

    /// A scripted batch cursor: yields a fixed list of outcomes in order, then repeats an "idle,
    /// wait forever" empty batch. Each outcome is consumed exactly once per `next_batch` call.
    struct ScriptedCursor {
        outcomes: Vec<Result<Batch>>,
        closed: bool,
        max_wire_version: i32,
        first_batch_empty: bool,
        batch_size: Option<u32>,
    }

    impl ScriptedCursor {
        fn new(outcomes: Vec<Result<Batch>>) -> Self {
            Self {
                outcomes,
                closed: false,
                max_wire_version: 13,
                first_batch_empty: false,
                batch_size: None,
            }
        }
    }

    #[async_trait]
    impl BatchCursor for ScriptedCursor {
        async fn next_batch(&mut self) -> Result<Batch> {
            if self.outcomes.is_empty() {
                return Ok(Batch::default());
            }
            self.outcomes.remove(0)
        }

        async fn try_next_batch(&mut self) -> Result<Batch> {
            self.next_batch().await
        }

        async fn close(&mut self) {
            self.closed = true;
        }

        fn set_batch_size(&mut self, size: u32) {
            self.batch_size = Some(size);
        }

        fn batch_size(&self) -> Option<u32> {
            self.batch_size
        }

        fn post_batch_resume_token(&self) -> Option<&ResumeToken> {
            None
        }

        fn first_batch_empty(&self) -> bool {
            self.first_batch_empty
        }

        fn max_wire_version(&self) -> i32 {
            self.max_wire_version
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    struct FakeDescriptor {
        resumed: AtomicUsize,
        next_cursor: Mutex<Option<Box<dyn BatchCursor>>>,
        release_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OperationDescriptor<Doc> for FakeDescriptor {
        async fn execute(&self, _binding: &dyn Binding) -> Result<FreshCursor> {
            self.resumed.fetch_add(1, AtomicOrdering::SeqCst);
            let cursor = self
                .next_cursor
                .lock()
                .unwrap()
                .take()
                .expect("resume called more times than scripted");
            Ok(FreshCursor {
                underlying: cursor,
                binding: Box::new(FakeBinding {
                    release_count: Arc::clone(&self.release_count),
                    max_wire_version: 13,
                }),
            })
        }

        fn set_resume_parameters(&self, _token: Option<ResumeToken>, _max_wire_version: i32) {}

        fn start_at_operation_time(&self) -> Option<Timestamp> {
            None
        }
    }

    fn network_error() -> Error {
        Error::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
    }

    /// A batch cursor whose `next_batch` signals `started_tx` as soon as it is entered, then
    /// suspends until `proceed_rx` fires, so a test can reliably observe "a fetch is in flight"
    /// before racing a `close()` against it.
    struct SuspendingCursor {
        started_tx: Option<tokio::sync::oneshot::Sender<()>>,
        proceed_rx: Option<tokio::sync::oneshot::Receiver<()>>,
        closed: bool,
    }

    #[async_trait]
    impl BatchCursor for SuspendingCursor {
        async fn next_batch(&mut self) -> Result<Batch> {
            if let Some(tx) = self.started_tx.take() {
                let _ = tx.send(());
            }
            if let Some(rx) = self.proceed_rx.take() {
                let _ = rx.await;
            }
            Ok(Batch {
                events: vec![raw_event(1, 1)],
                post_batch_resume_token: None,
            })
        }

        async fn try_next_batch(&mut self) -> Result<Batch> {
            self.next_batch().await
        }

        async fn close(&mut self) {
            self.closed = true;
        }

        fn set_batch_size(&mut self, _size: u32) {}

        fn batch_size(&self) -> Option<u32> {
            None
        }

        fn post_batch_resume_token(&self) -> Option<&ResumeToken> {
            None
        }

        fn first_batch_empty(&self) -> bool {
            false
        }

        fn max_wire_version(&self) -> i32 {
            13
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn make_cursor(
        outcomes: Vec<Result<Batch>>,
        next_cursor: Option<ScriptedCursor>,
        release_count: Arc<AtomicUsize>,
    ) -> ResumableCursor<Doc> {
        let underlying: Box<dyn BatchCursor> = Box::new(ScriptedCursor::new(outcomes));
        let binding: Box<dyn Binding> = Box::new(FakeBinding {
            release_count: Arc::clone(&release_count),
            max_wire_version: 13,
        });
        let descriptor: Box<dyn OperationDescriptor<Doc>> = Box::new(FakeDescriptor {
            resumed: AtomicUsize::new(0),
            next_cursor: Mutex::new(next_cursor.map(|c| Box::new(c) as Box<dyn BatchCursor>)),
            release_count,
        });
        ResumableCursor::new(underlying, binding, descriptor, None)
    }

    #[tokio::test]
    async fn happy_path_decodes_events_and_advances_token() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let cursor = make_cursor(
            vec![Ok(Batch {
                events: vec![raw_event(1, 10), raw_event(2, 20)],
                post_batch_resume_token: None,
            })],
            None,
            release_count,
        );

        let events = cursor.next().await.unwrap();
        assert_eq!(events, vec![Doc { x: 10 }, Doc { x: 20 }]);
        assert_eq!(cursor.resume_token(), Some(token(2)));
    }

    #[tokio::test]
    async fn post_batch_token_takes_precedence_over_last_event() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let cursor = make_cursor(
            vec![Ok(Batch {
                events: vec![raw_event(1, 10)],
                post_batch_resume_token: Some(token(99)),
            })],
            None,
            release_count,
        );

        cursor.next().await.unwrap();
        assert_eq!(cursor.resume_token(), Some(token(99)));
    }

    #[tokio::test]
    async fn resumes_transparently_on_resumable_error() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let fresh = ScriptedCursor::new(vec![Ok(Batch {
            events: vec![raw_event(5, 50)],
            post_batch_resume_token: None,
        })]);
        let cursor = make_cursor(vec![Err(network_error())], Some(fresh), release_count);

        let events = cursor.next().await.unwrap();
        assert_eq!(events, vec![Doc { x: 50 }]);
        assert_eq!(cursor.resume_token(), Some(token(5)));
        assert_eq!(cursor.max_wire_version(), 13);
    }

    #[tokio::test]
    async fn missing_id_aborts_without_advancing_token() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let cursor = make_cursor(
            vec![Ok(Batch {
                events: vec![raw_event(1, 10), raw_event_missing_id(20)],
                post_batch_resume_token: None,
            })],
            None,
            release_count,
        );

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::MissingResumeToken));
        assert_eq!(cursor.resume_token(), None);
    }

    #[tokio::test]
    async fn non_resumable_error_surfaces_immediately() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let auth_err = Error::new(ErrorKind::Authorization {
            message: "not authorized".into(),
        });
        let cursor = make_cursor(vec![Err(auth_err)], None, release_count);

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::Authorization { .. }));
    }

    #[tokio::test]
    async fn close_releases_binding_exactly_once() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let cursor = make_cursor(vec![], None, Arc::clone(&release_count));

        cursor.close().await;
        cursor.close().await;

        assert!(cursor.is_closed());
        assert_eq!(release_count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_after_closed_is_a_no_op() {
        let release_count = Arc::new(AtomicUsize::new(0));
        let cursor = make_cursor(vec![], None, release_count);
        cursor.close().await;

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::CursorClosed { operation: "next()" }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_during_in_flight_fetch_is_deferred_until_completion() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (proceed_tx, proceed_rx) = tokio::sync::oneshot::channel();

        let release_count = Arc::new(AtomicUsize::new(0));
        let underlying: Box<dyn BatchCursor> = Box::new(SuspendingCursor {
            started_tx: Some(started_tx),
            proceed_rx: Some(proceed_rx),
            closed: false,
        });
        let binding: Box<dyn Binding> = Box::new(FakeBinding {
            release_count: Arc::clone(&release_count),
            max_wire_version: 13,
        });
        let descriptor: Box<dyn OperationDescriptor<Doc>> = Box::new(FakeDescriptor {
            resumed: AtomicUsize::new(0),
            next_cursor: Mutex::new(None),
            release_count: Arc::clone(&release_count),
        });
        let cursor = Arc::new(ResumableCursor::new(underlying, binding, descriptor, None));

        let fetch_cursor = Arc::clone(&cursor);
        let fetch_task = tokio::spawn(async move { fetch_cursor.next().await });

        started_rx.await.unwrap();

        cursor.close().await;
        assert!(!cursor.is_closed(), "close must defer while a fetch is in flight");
        assert_eq!(release_count.load(AtomicOrdering::SeqCst), 0);

        proceed_tx.send(()).unwrap();

        let events = fetch_task.await.unwrap().unwrap();
        assert_eq!(events, vec![Doc { x: 1 }]);

        assert!(cursor.is_closed(), "deferred close must run once the fetch completes");
        assert_eq!(release_count.load(AtomicOrdering::SeqCst), 1);

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::CursorClosed { operation: "next()" }));
    }
}
