//! The work-item protocol: deferred operations applied by the consumer.
//!
//! A work item is constructed in place inside an arena record at submit
//! time and applied exactly once between submission and the arena's next
//! clear. Anything an item depends on is captured at submit time, either
//! by value or by copying bytes into the record's tail, so nothing ever
//! points back into the submitter's stack.

use std::fmt;
use std::io::SeekFrom;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{WorkError, WorkResult};
use crate::sink::{Extract, Sink, Source, StreamState};

/// What a work item gets to touch while it is applied: the stream's bound
/// sink and/or source, for exactly the duration of one drain.
pub struct ApplyCtx<'a> {
    sink: Option<&'a mut (dyn Sink + 'static)>,
    source: Option<&'a mut (dyn Source + 'static)>,
}

impl<'a> ApplyCtx<'a> {
    pub fn new(
        sink: Option<&'a mut (dyn Sink + 'static)>,
        source: Option<&'a mut (dyn Source + 'static)>,
    ) -> Self {
        Self { sink, source }
    }

    /// The bound sink.
    ///
    /// A write item on a stream with no sink is a programmer error, not a
    /// work failure: debug builds assert. Release builds report
    /// [`WorkError::NoSink`] through the error handler instead of
    /// touching an unbound writer.
    pub fn sink(&mut self) -> WorkResult<&mut dyn Sink> {
        debug_assert!(
            self.sink.is_some(),
            "write item applied to a stream with no sink bound"
        );
        match self.sink {
            Some(ref mut sink) => Ok(&mut **sink),
            None => Err(WorkError::NoSink),
        }
    }

    /// The bound source.
    ///
    /// A parse item on a stream with no source is a programmer error, not
    /// a work failure: debug builds assert. Release builds report
    /// [`WorkError::NoSource`] through the error handler instead of
    /// touching an unbound reader.
    pub fn source(&mut self) -> WorkResult<&mut dyn Source> {
        debug_assert!(
            self.source.is_some(),
            "parse item applied to a stream with no source bound"
        );
        match self.source {
            Some(ref mut source) => Ok(&mut **source),
            None => Err(WorkError::NoSource),
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }
}

/// A deferred operation laid out inline in an arena record.
///
/// `apply` runs on the consumer thread. It may write to the sink, read
/// from the source, both, or neither; failures are routed to the service's
/// error handler and never stop the drain. The item itself is dropped
/// later, when the page is cleared for its next generation.
pub trait Record: Send + 'static {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()>;
}

/// Formats one value into the sink.
pub struct Fmt<T> {
    value: T,
}

impl<T: fmt::Display + Send + 'static> Fmt<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: fmt::Display + Send + 'static> Record for Fmt<T> {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        ctx.sink()?.write_fmt(format_args!("{}", self.value))?;
        Ok(())
    }
}

/// Writes a byte run verbatim. The bytes live in the same arena record as
/// the item (copied there at submit time) and stay valid until the item is
/// dropped.
pub struct RawBytes {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the pointed-to bytes sit in the same arena record as the item
// and move between threads together with it.
unsafe impl Send for RawBytes {}

impl RawBytes {
    /// `ptr` must address `len` bytes that live as long as the item; the
    /// arena's tail-copying push upholds this.
    pub fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Record for RawBytes {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        ctx.sink()?.write_all(self.bytes())?;
        Ok(())
    }
}

/// Shared cell a parse work item extracts into.
///
/// The drain thread outlives any stack borrow, so "the submitter
/// guarantees the consumer reference outlives the work item" is expressed
/// as shared ownership: the submitter keeps one handle, the work item
/// holds another.
pub struct ParseTarget<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> ParseTarget<C> {
    pub fn new(initial: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.lock()
    }

    pub fn get(&self) -> C
    where
        C: Clone,
    {
        self.inner.lock().clone()
    }
}

impl<C> Clone for ParseTarget<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Extracts one value from the source into a [`ParseTarget`].
pub struct ParseInto<C> {
    target: ParseTarget<C>,
}

impl<C: Extract + Send + 'static> ParseInto<C> {
    pub fn new(target: ParseTarget<C>) -> Self {
        Self { target }
    }
}

impl<C: Extract + Send + 'static> Record for ParseInto<C> {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        let value = C::extract(ctx.source()?)?;
        *self.target.lock() = value;
        Ok(())
    }
}

/// Raw byte write plus a completion handler invoked with the sink state
/// and the byte count after the write. A non-good state is conveyed to
/// the handler, not treated as a drain error.
pub struct AsyncWrite<F> {
    bytes: RawBytes,
    handler: Option<F>,
}

impl<F: FnOnce(StreamState, usize) + Send + 'static> AsyncWrite<F> {
    pub fn new(ptr: NonNull<u8>, len: usize, handler: F) -> Self {
        Self {
            bytes: RawBytes::new(ptr, len),
            handler: Some(handler),
        }
    }
}

impl<F: FnOnce(StreamState, usize) + Send + 'static> Record for AsyncWrite<F> {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        let sink = ctx.sink()?;
        let written = match sink.write_all(self.bytes.bytes()) {
            Ok(()) => self.bytes.len,
            Err(_) => 0,
        };
        let state = sink.state();
        if let Some(handler) = self.handler.take() {
            handler(state, written);
        }
        Ok(())
    }
}

/// Parse into a target plus a completion handler invoked with the source
/// state. The byte count reported is always `0`: the wrapped reader does
/// not report progress.
pub struct AsyncParse<C, F> {
    target: ParseTarget<C>,
    handler: Option<F>,
}

impl<C, F> AsyncParse<C, F>
where
    C: Extract + Send + 'static,
    F: FnOnce(StreamState, usize) + Send + 'static,
{
    pub fn new(target: ParseTarget<C>, handler: F) -> Self {
        Self {
            target,
            handler: Some(handler),
        }
    }
}

impl<C, F> Record for AsyncParse<C, F>
where
    C: Extract + Send + 'static,
    F: FnOnce(StreamState, usize) + Send + 'static,
{
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        let source = ctx.source()?;
        if let Ok(value) = C::extract(source) {
            *self.target.lock() = value;
        }
        let state = ctx.source()?.state();
        if let Some(handler) = self.handler.take() {
            handler(state, 0);
        }
        Ok(())
    }
}

/// Invokes a stored callback; the sink and source are untouched. Marks a
/// point in the submission order, e.g. "everything before this is done".
pub struct Done<F> {
    callback: Option<F>,
}

impl<F: FnOnce() + Send + 'static> Done<F> {
    pub fn new(callback: F) -> Self {
        Self {
            callback: Some(callback),
        }
    }
}

impl<F: FnOnce() + Send + 'static> Record for Done<F> {
    fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        if let Some(callback) = self.callback.take() {
            callback();
        }
        Ok(())
    }
}

/// Gap filler emitted by the arena when a record would straddle a page
/// boundary; keeps the forward walk valid and does nothing when applied.
pub struct PageBreak;

impl Record for PageBreak {
    fn apply(&mut self, _ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        Ok(())
    }
}

/// Repositions the sink.
pub struct SeekTo(pub SeekFrom);

impl Record for SeekTo {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        ctx.sink()?.seek(self.0)?;
        Ok(())
    }
}

/// Replaces the sink's status word.
pub struct ClearState(pub StreamState);

impl Record for ClearState {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        ctx.sink()?.clear_state(self.0);
        Ok(())
    }
}

/// ORs bits into the status word: of the source when one is bound,
/// otherwise of the sink.
pub struct SetState(pub StreamState);

impl Record for SetState {
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        if ctx.has_source() {
            ctx.source()?.set_state(self.0);
        } else {
            ctx.sink()?.set_state(self.0);
        }
        Ok(())
    }
}

/// Applies an arbitrary closure to the sink on the drain thread. This is
/// the escape hatch for sink configuration that has no dedicated work
/// item (the locale-imbuing slot of classic formatted streams).
pub struct WithSink<F> {
    configure: Option<F>,
}

impl<F> WithSink<F>
where
    F: FnOnce(&mut dyn Sink) -> WorkResult<()> + Send + 'static,
{
    pub fn new(configure: F) -> Self {
        Self {
            configure: Some(configure),
        }
    }
}

impl<F> Record for WithSink<F>
where
    F: FnOnce(&mut dyn Sink) -> WorkResult<()> + Send + 'static,
{
    fn apply(&mut self, ctx: &mut ApplyCtx<'_>) -> WorkResult<()> {
        let sink = ctx.sink()?;
        if let Some(configure) = self.configure.take() {
            configure(sink)?;
        }
        Ok(())
    }
}
