use crate::{
    error::Result,
    input::{InputChunk, InputSource, InputStream, Pulled},
    iter::IterFlags,
    CHUNK_SIZE,
};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Outcome of one pump tick.
#[derive(Debug, Copy, Clone)]
pub(crate) struct PumpProgress {
    pub wrote: usize,
    /// End-of-flow. Reported exactly once, when the source is sealed
    /// and drained and no residual or active stream remains; the
    /// caller closes the child's stdin in response.
    pub end: bool,
}

struct ActiveStream {
    stream: Box<dyn InputStream>,
    offset: u64,
}

enum Frame {
    Source(InputSource),
    Iter(Box<dyn Iterator<Item = InputChunk> + Send>),
    Child {
        sup: Box<crate::Supervisor>,
        primed: bool,
    },
}

enum Pull {
    Data(Vec<u8>),
    Stream(Box<dyn InputStream>),
    Pending,
    End,
}

/// Drains an [`InputSource`] into a writable pipe with non-blocking
/// writes. Bytes that did not fit in the last write stay in the
/// residual buffer and are flushed before anything new is pulled, so
/// short writes never lose or duplicate input. Nested sources are
/// flattened depth-first via a work stack.
pub(crate) struct InputPump {
    residual: Vec<u8>,
    res_off: usize,
    active: Option<ActiveStream>,
    stack: Vec<Frame>,
    finished: bool,
}

impl InputPump {
    pub fn new(root: InputSource) -> Self {
        InputPump {
            residual: Vec::new(),
            res_off: 0,
            active: None,
            stack: vec![Frame::Source(root)],
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// One tick: flush residual, feed the active stream, pull new
    /// chunks. Returns on a full pipe (`WouldBlock`), on an open
    /// source with nothing queued, or at end-of-flow.
    pub fn write_to<W: Write>(&mut self, pipe: &mut W) -> Result<PumpProgress> {
        let mut wrote = 0;
        if self.finished {
            return Ok(PumpProgress { wrote, end: false });
        }
        loop {
            if self.res_off < self.residual.len() {
                match pipe.write(&self.residual[self.res_off..]) {
                    Ok(n) => {
                        self.res_off += n;
                        wrote += n;
                        if self.res_off == self.residual.len() {
                            self.residual.clear();
                            self.res_off = 0;
                        }
                        if n == 0 {
                            // a sink that accepts nothing is as good as full
                            return Ok(PumpProgress { wrote, end: false });
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(PumpProgress { wrote, end: false });
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
            if let Some(mut active) = self.active.take() {
                active.stream.seek(SeekFrom::Start(active.offset))?;
                let mut buf = vec![0u8; CHUNK_SIZE];
                let n = active.stream.read(&mut buf)?;
                if n > 0 {
                    active.offset += n as u64;
                    buf.truncate(n);
                    self.residual = buf;
                    self.res_off = 0;
                    self.active = Some(active);
                }
                continue;
            }
            match self.pull()? {
                Pull::Data(bytes) => {
                    self.residual = bytes;
                    self.res_off = 0;
                }
                Pull::Stream(stream) => {
                    self.active = Some(ActiveStream { stream, offset: 0 });
                }
                Pull::Pending => return Ok(PumpProgress { wrote, end: false }),
                Pull::End => {
                    self.finished = true;
                    return Ok(PumpProgress { wrote, end: true });
                }
            }
        }
    }

    /// Depth-first, left-to-right pull of the next non-trivial chunk.
    fn pull(&mut self) -> Result<Pull> {
        enum Action {
            Chunk(InputChunk),
            Pop,
            PopChild,
        }
        loop {
            let action = match self.stack.last_mut() {
                None => return Ok(Pull::End),
                Some(Frame::Source(src)) => match src.poll_chunk() {
                    Pulled::Taken(chunk) => Action::Chunk(chunk),
                    Pulled::Pending => return Ok(Pull::Pending),
                    Pulled::End => Action::Pop,
                },
                Some(Frame::Iter(it)) => match it.next() {
                    Some(chunk) => Action::Chunk(chunk),
                    None => Action::Pop,
                },
                Some(Frame::Child { sup, primed }) => {
                    if !*primed {
                        sup.set_iter_flags(IterFlags {
                            non_blocking: true,
                            skip_out: false,
                            skip_err: true,
                        });
                        *primed = true;
                    }
                    if sup.iter_valid()? {
                        match sup.iter_take() {
                            Some((_, bytes)) if !bytes.is_empty() => {
                                Action::Chunk(InputChunk::Bytes(bytes))
                            }
                            // synthetic empty chunk: no data from the
                            // child yet, try again next tick
                            _ => return Ok(Pull::Pending),
                        }
                    } else {
                        Action::PopChild
                    }
                }
            };
            match action {
                Action::Pop => {
                    self.stack.pop();
                }
                Action::PopChild => {
                    if let Some(Frame::Child { mut sup, .. }) = self.stack.pop() {
                        sup.restore_iter_flags();
                    }
                }
                Action::Chunk(chunk) => match chunk {
                    InputChunk::Bytes(b) => {
                        if !b.is_empty() {
                            return Ok(Pull::Data(b));
                        }
                    }
                    InputChunk::Stream(s) => return Ok(Pull::Stream(s)),
                    InputChunk::Source(s) => self.stack.push(Frame::Source(s)),
                    InputChunk::Iter(i) => self.stack.push(Frame::Iter(i)),
                    InputChunk::Child(sup) => self.stack.push(Frame::Child { sup, primed: false }),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts at most `cap` bytes per write call.
    struct ShortPipe {
        data: Vec<u8>,
        cap: usize,
    }

    impl ShortPipe {
        fn new(cap: usize) -> Self {
            ShortPipe { data: Vec::new(), cap }
        }
    }

    impl Write for ShortPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.cap);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain(pump: &mut InputPump, pipe: &mut ShortPipe) {
        loop {
            let progress = pump.write_to(pipe).unwrap();
            if progress.end {
                return;
            }
            assert!(
                progress.wrote > 0 || pump.is_finished(),
                "pump made no progress on an unsealed tick"
            );
        }
    }

    #[test]
    fn nested_sources_flatten_depth_first() {
        let inner = InputSource::new();
        inner.write("b").unwrap();
        inner.write("c").unwrap();
        inner.close();

        let root = InputSource::new();
        root.write("a").unwrap();
        root.write(inner).unwrap();
        root.write("d").unwrap();
        root.close();

        let mut pump = InputPump::new(root);
        let mut pipe = ShortPipe::new(usize::MAX);
        drain(&mut pump, &mut pipe);
        assert_eq!(pipe.data, b"abcd");
    }

    #[test]
    fn lazy_iterators_and_streams_flatten_in_order() {
        let root = InputSource::new();
        root.write("x").unwrap();
        root.write(InputChunk::sequence(vec![
            InputChunk::from("y"),
            InputChunk::stream(Cursor::new(b"z1z2".to_vec())),
        ]))
        .unwrap();
        root.close();

        let mut pump = InputPump::new(root);
        let mut pipe = ShortPipe::new(3);
        drain(&mut pump, &mut pipe);
        assert_eq!(pipe.data, b"xyz1z2");
    }

    #[test]
    fn short_writes_preserve_every_byte() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let payload: Vec<u8> = (0..16 * 1024).map(|_| rng.gen()).collect();

        for _ in 0..8 {
            let cap = rng.gen_range(1..97);
            let root = InputSource::new();
            for piece in payload.chunks(777) {
                root.write(piece).unwrap();
            }
            root.close();

            let mut pump = InputPump::new(root);
            let mut pipe = ShortPipe::new(cap);
            drain(&mut pump, &mut pipe);
            assert_eq!(pipe.data, payload, "lost or duplicated bytes at cap {}", cap);
        }
    }

    #[test]
    fn end_of_flow_is_reported_once() {
        let root = InputSource::of("a");
        let mut pump = InputPump::new(root);
        let mut pipe = ShortPipe::new(usize::MAX);
        let first = pump.write_to(&mut pipe).unwrap();
        assert!(first.end);
        let second = pump.write_to(&mut pipe).unwrap();
        assert!(!second.end);
        assert!(pump.is_finished());
    }

    #[test]
    fn open_source_yields_without_ending() {
        let root = InputSource::new();
        root.write("a").unwrap();
        let mut pump = InputPump::new(root.clone());
        let mut pipe = ShortPipe::new(usize::MAX);
        let progress = pump.write_to(&mut pipe).unwrap();
        assert_eq!(pipe.data, b"a");
        assert!(!progress.end);

        root.write("b").unwrap();
        root.close();
        let progress = pump.write_to(&mut pipe).unwrap();
        assert!(progress.end);
        assert_eq!(pipe.data, b"ab");
    }

    #[test]
    fn full_pipe_keeps_residual_for_next_tick() {
        struct FullPipe;
        impl Write for FullPipe {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let root = InputSource::of("payload");
        let mut pump = InputPump::new(root);
        let progress = pump.write_to(&mut FullPipe).unwrap();
        assert_eq!(progress.wrote, 0);
        assert!(!progress.end);

        let mut pipe = ShortPipe::new(usize::MAX);
        let progress = pump.write_to(&mut pipe).unwrap();
        assert!(progress.end);
        assert_eq!(pipe.data, b"payload");
    }
}
