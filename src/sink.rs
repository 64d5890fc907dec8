//! The synchronous formatted writer/reader surface the engine drains into.
//!
//! Work items only ever touch these traits on the consumer thread; nothing
//! here is called on the submission hot path.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::BitOr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{WorkError, WorkResult};

/// Stream status word, modelled on the iostream state bits.
///
/// [`StreamState::GOOD`] is the empty word; the other constants are single
/// bits that can be OR-combined.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState(u8);

impl StreamState {
    /// No error condition.
    pub const GOOD: StreamState = StreamState(0);
    /// End of input reached.
    pub const EOF: StreamState = StreamState(1);
    /// A recoverable formatting or extraction failure.
    pub const FAIL: StreamState = StreamState(2);
    /// The underlying byte channel is unusable.
    pub const BAD: StreamState = StreamState(4);

    #[inline]
    pub fn is_good(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: StreamState) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: StreamState) {
        self.0 |= other.0;
    }
}

impl BitOr for StreamState {
    type Output = StreamState;

    fn bitor(self, rhs: StreamState) -> StreamState {
        StreamState(self.0 | rhs.0)
    }
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_good() {
            return write!(f, "good");
        }
        let mut sep = "";
        for (bit, name) in [
            (StreamState::EOF, "eof"),
            (StreamState::FAIL, "fail"),
            (StreamState::BAD, "bad"),
        ] {
            if self.contains(bit) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        Ok(())
    }
}

/// A synchronous formatted writer.
///
/// The engine calls these methods only on its drain thread, one work item
/// at a time, so implementations need no internal synchronization beyond
/// being [`Send`].
pub trait Sink: Send {
    /// Writes as many bytes as the sink will take, returning the count.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.write(rest)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted no bytes",
                ));
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Formatted insertion. The default formats into a scratch buffer;
    /// this runs on the drain thread, never on the submit path.
    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        match args.as_str() {
            Some(s) => self.write_all(s.as_bytes()),
            None => self.write_all(fmt::format(args).as_bytes()),
        }
    }

    fn flush(&mut self) -> io::Result<()>;

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    fn state(&self) -> StreamState;

    /// Replaces the whole status word (iostream `clear(state)` semantics).
    fn clear_state(&mut self, state: StreamState);

    /// ORs bits into the status word (iostream `setstate` semantics).
    fn set_state(&mut self, state: StreamState);
}

/// A synchronous formatted reader.
pub trait Source: Send {
    /// Skips leading whitespace and appends the next whitespace-delimited
    /// token to `buf`. Returns the number of bytes appended; `0` means end
    /// of input.
    fn read_token(&mut self, buf: &mut String) -> io::Result<usize>;

    fn state(&self) -> StreamState;

    fn set_state(&mut self, state: StreamState);
}

/// Formatted extraction of a value from a [`Source`].
///
/// Blanket-implemented for every [`FromStr`](std::str::FromStr) type, which
/// covers the primitive extractions the engine promises.
pub trait Extract: Sized {
    fn extract(source: &mut dyn Source) -> WorkResult<Self>;
}

impl<T> Extract for T
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    fn extract(source: &mut dyn Source) -> WorkResult<Self> {
        let mut token = String::new();
        source.read_token(&mut token)?;
        if token.is_empty() {
            source.set_state(StreamState::EOF | StreamState::FAIL);
            return Err(WorkError::parse("unexpected end of input"));
        }
        match token.parse::<T>() {
            Ok(value) => Ok(value),
            Err(err) => {
                source.set_state(StreamState::FAIL);
                Err(WorkError::parse(err))
            }
        }
    }
}

/// Adapts any `Write + Seek` into a [`Sink`], tracking iostream-style
/// state bits across failures.
pub struct IoSink<W> {
    inner: W,
    state: StreamState,
}

impl<W: Write + Seek + Send> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            state: StreamState::GOOD,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write + Seek + Send> Sink for IoSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(err) => {
                self.state.insert(StreamState::BAD);
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self.inner.seek(pos) {
            Ok(n) => Ok(n),
            Err(err) => {
                self.state.insert(StreamState::FAIL);
                Err(err)
            }
        }
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn clear_state(&mut self, state: StreamState) {
        self.state = state;
    }

    fn set_state(&mut self, state: StreamState) {
        self.state.insert(state);
    }
}

struct MemoryInner {
    buf: Vec<u8>,
    pos: usize,
    state: StreamState,
}

/// An in-memory [`Sink`] whose buffer outlives the stream it is bound to.
///
/// Cloning yields another handle onto the same buffer, so a test (or any
/// observer) can keep one handle while the stream owns the other.
#[derive(Clone)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                buf: Vec::new(),
                pos: 0,
                state: StreamState::GOOD,
            })),
        }
    }

    /// Snapshot of the written bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().buf.clone()
    }

    /// Written bytes as a string, replacing invalid UTF-8.
    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().buf).into_owned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        let end = pos + buf.len();
        if end > inner.buf.len() {
            inner.buf.resize(end, 0);
        }
        inner.buf[pos..end].copy_from_slice(buf);
        inner.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut inner = self.inner.lock();
        let len = inner.buf.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(off) => len + off,
            SeekFrom::Current(off) => inner.pos as i64 + off,
        };
        if target < 0 {
            inner.state.insert(StreamState::FAIL);
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        inner.pos = target as usize;
        Ok(target as u64)
    }

    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn clear_state(&mut self, state: StreamState) {
        self.inner.lock().state = state;
    }

    fn set_state(&mut self, state: StreamState) {
        self.inner.lock().state.insert(state);
    }
}

/// An in-memory [`Source`] over a fixed byte buffer.
pub struct MemorySource {
    reader: io::Cursor<Vec<u8>>,
    state: StreamState,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            reader: io::Cursor::new(data.into()),
            state: StreamState::GOOD,
        }
    }
}

impl Source for MemorySource {
    fn read_token(&mut self, buf: &mut String) -> io::Result<usize> {
        let mut appended = 0;
        let mut byte = [0u8; 1];
        // Skip leading whitespace.
        let mut current = loop {
            match self.reader.read(&mut byte)? {
                0 => {
                    self.state.insert(StreamState::EOF);
                    return Ok(0);
                }
                _ if byte[0].is_ascii_whitespace() => continue,
                _ => break byte[0],
            }
        };
        loop {
            buf.push(current as char);
            appended += 1;
            match self.reader.read(&mut byte)? {
                0 => {
                    self.state.insert(StreamState::EOF);
                    break;
                }
                _ if byte[0].is_ascii_whitespace() => break,
                _ => current = byte[0],
            }
        }
        Ok(appended)
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn set_state(&mut self, state: StreamState) {
        self.state.insert(state);
    }
}
