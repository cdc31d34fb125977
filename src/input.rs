use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    fmt,
    io::{Read, Seek},
    sync::Arc,
};

/// Byte stream usable as an input chunk.
///
/// The pump tracks an explicit file offset for the active stream and
/// re-seeks before every read, so the stream must be seekable.
/// `std::fs::File` is the typical implementor.
pub trait InputStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> InputStream for T {}

/// One element of an [`InputSource`].
///
/// Anything convertible into a chunk can be passed to
/// [`InputSource::write`]: byte strings, scalars (coerced to their
/// decimal form), seekable streams, nested sources, lazy chunk
/// iterators, or a whole [`Supervisor`](crate::Supervisor) whose
/// standard output becomes the input of this one.
pub enum InputChunk {
    Bytes(Vec<u8>),
    Stream(Box<dyn InputStream>),
    Source(InputSource),
    Child(Box<crate::Supervisor>),
    Iter(Box<dyn Iterator<Item = InputChunk> + Send>),
}

impl InputChunk {
    /// Wraps a seekable byte stream. Ownership transfers to the pump,
    /// which drops the stream once it is exhausted.
    pub fn stream(s: impl InputStream + 'static) -> Self {
        InputChunk::Stream(Box::new(s))
    }

    /// A lazily-consumed sequence of chunks. The next element is not
    /// requested until the previous one has been fully written.
    pub fn sequence<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<InputChunk> + 'static,
        I::IntoIter: Send + 'static,
    {
        InputChunk::Iter(Box::new(items.into_iter().map(Into::into)))
    }

    pub(crate) fn is_empty_bytes(&self) -> bool {
        matches!(self, InputChunk::Bytes(b) if b.is_empty())
    }
}

impl fmt::Debug for InputChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputChunk::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            InputChunk::Stream(_) => f.write_str("Stream"),
            InputChunk::Source(_) => f.write_str("Source"),
            InputChunk::Child(_) => f.write_str("Child"),
            InputChunk::Iter(_) => f.write_str("Iter"),
        }
    }
}

impl From<&str> for InputChunk {
    fn from(s: &str) -> Self {
        InputChunk::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for InputChunk {
    fn from(s: String) -> Self {
        InputChunk::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for InputChunk {
    fn from(b: Vec<u8>) -> Self {
        InputChunk::Bytes(b)
    }
}

impl From<&[u8]> for InputChunk {
    fn from(b: &[u8]) -> Self {
        InputChunk::Bytes(b.to_vec())
    }
}

impl From<std::fs::File> for InputChunk {
    fn from(f: std::fs::File) -> Self {
        InputChunk::stream(f)
    }
}

impl From<InputSource> for InputChunk {
    fn from(s: InputSource) -> Self {
        InputChunk::Source(s)
    }
}

impl From<crate::Supervisor> for InputChunk {
    fn from(s: crate::Supervisor) -> Self {
        InputChunk::Child(Box::new(s))
    }
}

/// `None` is the "absent" chunk: writing it is a no-op.
impl<T: Into<InputChunk>> From<Option<T>> for InputChunk {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => InputChunk::Bytes(Vec::new()),
        }
    }
}

macro_rules! chunk_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for InputChunk {
            fn from(v: $t) -> Self {
                let mut buf = itoa::Buffer::new();
                InputChunk::Bytes(buf.format(v).as_bytes().to_vec())
            }
        }
    )*};
}

chunk_from_int!(i32, i64, u32, u64, usize, isize);

impl From<f64> for InputChunk {
    fn from(v: f64) -> Self {
        InputChunk::Bytes(v.to_string().into_bytes())
    }
}

impl From<bool> for InputChunk {
    fn from(v: bool) -> Self {
        InputChunk::Bytes(v.to_string().into_bytes())
    }
}

/// Result of pulling on a source.
pub(crate) enum Pulled {
    /// A chunk was dequeued.
    Taken(InputChunk),
    /// The source is still open but has nothing queued right now.
    Pending,
    /// The source is sealed and fully drained.
    End,
}

#[derive(Default)]
struct SourceState {
    queue: VecDeque<InputChunk>,
    closed: bool,
}

/// Ordered, lazily-materialized sequence of input chunks.
///
/// The handle is cheap to clone and may be shared between the caller
/// and a running [`Supervisor`](crate::Supervisor): the caller appends
/// with [`write`](Self::write) while the pump drains from the front.
/// An open source with an empty queue is *not* at end; sealing it with
/// [`close`](Self::close) is what makes exhaustion reachable, at which
/// point the child's stdin is closed exactly once.
#[derive(Clone, Default)]
pub struct InputSource {
    inner: Arc<Mutex<SourceState>>,
}

impl InputSource {
    /// An open, empty source. Append with `write`, then `close`.
    pub fn new() -> Self {
        Default::default()
    }

    /// A sealed, empty source: the child sees immediate end of input.
    pub fn sealed() -> Self {
        let src = Self::new();
        src.close();
        src
    }

    /// A sealed source holding a single chunk.
    pub fn of(chunk: impl Into<InputChunk>) -> Self {
        let src = Self::new();
        // the source cannot be closed yet, so the write cannot fail
        let _ = src.write(chunk);
        src.close();
        src
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.inner.lock()
    }

    /// Appends a chunk. Writing the absent chunk (`None`) is a no-op;
    /// writing to a sealed source is an error.
    pub fn write(&self, chunk: impl Into<InputChunk>) -> Result<()> {
        let chunk = chunk.into();
        let mut state = self.state();
        if state.closed {
            return Err(Error::logic("cannot write to a closed input source"));
        }
        if !chunk.is_empty_bytes() {
            state.queue.push_back(chunk);
        }
        Ok(())
    }

    /// Seals the source. Idempotent.
    pub fn close(&self) {
        self.state().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// True while chunks are queued and not yet consumed.
    pub fn has_pending(&self) -> bool {
        !self.state().queue.is_empty()
    }

    /// Sealed with nothing left to consume.
    pub fn is_drained(&self) -> bool {
        let state = self.state();
        state.closed && state.queue.is_empty()
    }

    pub(crate) fn poll_chunk(&self) -> Pulled {
        let mut state = self.state();
        match state.queue.pop_front() {
            Some(chunk) => Pulled::Taken(chunk),
            None if state.closed => Pulled::End,
            None => Pulled::Pending,
        }
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("InputSource")
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_after_close_fails() {
        let src = InputSource::new();
        src.write("a").unwrap();
        src.close();
        let err = src.write("b").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Logic);
    }

    #[test]
    fn absent_chunk_is_noop() {
        let src = InputSource::new();
        src.write(None::<&str>).unwrap();
        assert!(!src.has_pending());
    }

    #[test]
    fn scalar_chunks_coerce_to_decimal_text() {
        let as_bytes = |c: InputChunk| match c {
            InputChunk::Bytes(b) => b,
            other => panic!("expected bytes, got {:?}", other),
        };
        assert_eq!(as_bytes(InputChunk::from(42_i64)), b"42");
        assert_eq!(as_bytes(InputChunk::from(true)), b"true");
        assert_eq!(as_bytes(InputChunk::from(1.5_f64)), b"1.5");
    }

    #[test]
    fn open_source_reports_pending_not_end() {
        let src = InputSource::new();
        assert!(matches!(src.poll_chunk(), Pulled::Pending));
        src.close();
        assert!(matches!(src.poll_chunk(), Pulled::End));
        assert!(src.is_drained());
    }

    #[test]
    fn sealed_source_drains_in_order() {
        let src = InputSource::new();
        src.write("a").unwrap();
        src.write("b").unwrap();
        src.close();
        for expected in &[b"a", b"b"] {
            match src.poll_chunk() {
                Pulled::Taken(InputChunk::Bytes(b)) => assert_eq!(&b, expected),
                _ => panic!("expected a byte chunk"),
            }
        }
        assert!(matches!(src.poll_chunk(), Pulled::End));
    }
}
