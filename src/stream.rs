//! A stream binds a swap queue, two arena pages, and a sink/source to a
//! draining service.

use std::io::SeekFrom;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::arena::Arena;
use crate::error::ErrorHandler;
use crate::executor::{Executor, ExecutorService, SchedPolicy};
use crate::queue::{Consume, SwapQueue};
use crate::service::Service;
use crate::sink::{Extract, Sink, Source, StreamState};
use crate::work::{
    ApplyCtx, AsyncParse, AsyncWrite, ClearState, Done, Fmt, ParseInto, ParseTarget, RawBytes,
    Record, SeekTo, SetState, WithSink,
};

struct IoBindings {
    sink: Option<Box<dyn Sink>>,
    source: Option<Box<dyn Source>>,
}

/// The drainable half of a stream, shared between the owning [`Stream`]
/// handle and the service's registry.
pub(crate) struct StreamCore {
    queue: SwapQueue,
    page1: *mut Arena,
    page2: *mut Arena,
    io: Mutex<IoBindings>,
    handler: Arc<dyn ErrorHandler>,
}

// SAFETY: the raw page pointers are only dereferenced through the queue's
// ownership protocol; everything else is synchronized.
unsafe impl Send for StreamCore {}
unsafe impl Sync for StreamCore {}

impl StreamCore {
    fn new(
        sink: Option<Box<dyn Sink>>,
        source: Option<Box<dyn Source>>,
        handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        debug_assert!(
            sink.is_some() || source.is_some(),
            "a stream needs a sink or a source"
        );
        let page1 = Box::into_raw(Box::new(Arena::new()));
        let page2 = Box::into_raw(Box::new(Arena::new()));
        // SAFETY: both pages are freshly boxed, distinct, and freed only
        // after the queue in Drop.
        let queue = unsafe { SwapQueue::new(page1, page2) };
        StreamCore {
            queue,
            page1,
            page2,
            io: Mutex::new(IoBindings { sink, source }),
            handler,
        }
    }

    /// Drains until the queue yields nothing more. Returns whether any
    /// page was drained.
    pub(crate) fn try_drain(&self) -> bool {
        let mut drained = false;
        loop {
            match self.queue.try_consume() {
                Consume::Consumed(mut txn) => {
                    let mut io = self.io.lock();
                    let IoBindings { sink, source } = &mut *io;
                    let mut ctx = ApplyCtx::new(sink.as_deref_mut(), source.as_deref_mut());
                    txn.arena().drain(&mut ctx, self.handler.as_ref());
                    drained = true;
                }
                _ => break,
            }
        }
        drained
    }

    /// Whether any inserts have not been consumed yet. A drain pass can
    /// report "nothing drained" while this is still true, e.g. when it ran
    /// into a producer mid-commit.
    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Synchronously flushes the bound sink; failures go to the error
    /// handler, as for any other drain-side failure.
    pub(crate) fn flush(&self) {
        if let Some(sink) = self.io.lock().sink.as_mut() {
            if let Err(err) = sink.flush() {
                self.handler.on_error(&err.into());
            }
        }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        // The queue releases its page pointers before the pages go away.
        // SAFETY: both pointers came from Box::into_raw in `new` and are
        // not referenced anywhere else at this point.
        unsafe {
            drop(Box::from_raw(self.page1));
            drop(Box::from_raw(self.page2));
        }
    }
}

/// An asynchronous stream: submissions return after appending a work item
/// to the inserter page; formatting and I/O happen later, on whichever
/// thread the bound [`Service`] drains from.
///
/// Dropping a stream deregisters it and then drains synchronously until
/// the queue is empty, so no submitted work is ever lost.
pub struct Stream {
    core: Arc<StreamCore>,
    service: Arc<dyn Service>,
}

impl Stream {
    /// A write-only stream bound to `sink`, drained by `service`.
    pub fn writer<S: Sink + 'static>(sink: S, service: Arc<dyn Service>) -> Stream {
        Self::build(Some(Box::new(sink)), None, service)
    }

    /// A read-only stream bound to `source`, drained by `service`.
    pub fn reader<R: Source + 'static>(source: R, service: Arc<dyn Service>) -> Stream {
        Self::build(None, Some(Box::new(source)), service)
    }

    /// A duplex stream bound to both a sink and a source.
    pub fn duplex<S: Sink + 'static, R: Source + 'static>(
        sink: S,
        source: R,
        service: Arc<dyn Service>,
    ) -> Stream {
        Self::build(Some(Box::new(sink)), Some(Box::new(source)), service)
    }

    /// A write-only stream drained by a service wrapped around an injected
    /// executor; the wrapper is owned by this stream and shut down with
    /// it.
    pub fn writer_with_executor<S: Sink + 'static>(
        sink: S,
        executor: Arc<dyn Executor>,
        policy: SchedPolicy,
        handler: Arc<dyn ErrorHandler>,
    ) -> Stream {
        let service = ExecutorService::start(executor, policy, handler);
        Self::build(Some(Box::new(sink)), None, service)
    }

    /// A read-only stream over an injected executor.
    pub fn reader_with_executor<R: Source + 'static>(
        source: R,
        executor: Arc<dyn Executor>,
        policy: SchedPolicy,
        handler: Arc<dyn ErrorHandler>,
    ) -> Stream {
        let service = ExecutorService::start(executor, policy, handler);
        Self::build(None, Some(Box::new(source)), service)
    }

    /// A duplex stream over an injected executor.
    pub fn duplex_with_executor<S: Sink + 'static, R: Source + 'static>(
        sink: S,
        source: R,
        executor: Arc<dyn Executor>,
        policy: SchedPolicy,
        handler: Arc<dyn ErrorHandler>,
    ) -> Stream {
        let service = ExecutorService::start(executor, policy, handler);
        Self::build(Some(Box::new(sink)), Some(Box::new(source)), service)
    }

    fn build(
        sink: Option<Box<dyn Sink>>,
        source: Option<Box<dyn Source>>,
        service: Arc<dyn Service>,
    ) -> Stream {
        let handler = service.registry().handler().clone();
        let core = Arc::new(StreamCore::new(sink, source, handler));
        service.registry().add(core.clone());
        debug!("stream registered");
        Stream { core, service }
    }

    /// Generic submit: appends any work item to the inserter page and
    /// signals the service.
    pub fn submit<W: Record>(&self, item: W) {
        let mut txn = self.core.queue.begin_insert();
        txn.arena().push(item);
        self.service.work_available();
        // txn commits on drop.
    }

    /// Submit with a byte payload copied into the same arena record.
    fn submit_with<W, F>(&self, bytes: &[u8], build: F)
    where
        W: Record,
        F: FnOnce(NonNull<u8>) -> W,
    {
        let mut txn = self.core.queue.begin_insert();
        txn.arena().push_with(bytes, build);
        self.service.work_available();
    }

    /// Formats `value` on the drain thread and writes it to the sink.
    pub fn write<T: std::fmt::Display + Send + 'static>(&self, value: T) {
        self.submit(Fmt::new(value));
    }

    /// Copies `bytes` into the arena now; writes them verbatim at drain.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let len = bytes.len();
        self.submit_with(bytes, |ptr| RawBytes::new(ptr, len));
    }

    /// Copies `s` into the arena now; writes it at drain. The pre-copied
    /// fast path for string data: no owned allocation travels with the
    /// work item.
    pub fn write_str(&self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn put(&self, byte: u8) {
        self.write_bytes(&[byte]);
    }

    /// Invokes `callback` once everything submitted before it has been
    /// applied.
    pub fn when_done<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.submit(Done::new(callback));
    }

    /// Writes `bytes` and then invokes `handler` with the sink state and
    /// the number of bytes written.
    pub fn async_write<F>(&self, bytes: &[u8], handler: F)
    where
        F: FnOnce(StreamState, usize) + Send + 'static,
    {
        let len = bytes.len();
        self.submit_with(bytes, |ptr| AsyncWrite::new(ptr, len, handler));
    }

    /// Extracts one value from the source into `target` on the drain
    /// thread.
    pub fn read_into<C: Extract + Send + 'static>(&self, target: &ParseTarget<C>) {
        self.submit(ParseInto::new(target.clone()));
    }

    /// Extracts into `target` and then invokes `handler` with the source
    /// state; the byte count reported is always `0`.
    pub fn async_parse<C, F>(&self, target: &ParseTarget<C>, handler: F)
    where
        C: Extract + Send + 'static,
        F: FnOnce(StreamState, usize) + Send + 'static,
    {
        self.submit(AsyncParse::new(target.clone(), handler));
    }

    pub fn seek(&self, pos: SeekFrom) {
        self.submit(SeekTo(pos));
    }

    /// Replaces the sink's status word at drain time.
    pub fn clear_state(&self, state: StreamState) {
        self.submit(ClearState(state));
    }

    /// ORs status bits into the source (or sink) at drain time.
    pub fn set_state(&self, state: StreamState) {
        self.submit(SetState(state));
    }

    /// Applies `configure` to the sink on the drain thread, in submission
    /// order with everything else.
    pub fn with_sink<F>(&self, configure: F)
    where
        F: FnOnce(&mut dyn Sink) -> crate::error::WorkResult<()> + Send + 'static,
    {
        self.submit(WithSink::new(configure));
    }

    /// Pre-pays the lazy page clear so the next submit is cheaper.
    pub fn warmup(&self) {
        self.core.queue.warmup_before_inserting();
    }

    /// Drains on the calling thread until the queue yields nothing more.
    pub fn try_drain(&self) -> bool {
        self.core.try_drain()
    }

    /// Synchronously flushes the bound sink.
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Inserts not yet consumed (dirty read).
    pub fn pending(&self) -> u64 {
        self.core.queue.len()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.service.registry().remove(&self.core);
        // Everything submitted must be applied before the stream goes
        // away. A concurrent service drain makes progress for us; yield
        // while it does.
        while !self.core.queue.is_empty() {
            if self.core.try_drain() {
                self.core.flush();
            } else {
                thread::yield_now();
            }
        }
        debug!("stream deregistered and drained");
    }
}
