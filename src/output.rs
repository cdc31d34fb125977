use crate::{
    error::{Error, Result},
    Channel, CHUNK_SIZE, SPILL_THRESHOLD,
};
use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    time::Instant,
};
use tempfile::SpooledTempFile;

/// One append-only, seekable byte store. Data stays in memory until it
/// crosses the spill threshold, then rolls over to an unnamed temp
/// file.
struct Store {
    file: SpooledTempFile,
    len: u64,
    /// Read offset of the iterator facade.
    cursor: u64,
}

impl Store {
    fn new() -> Self {
        Store {
            file: SpooledTempFile::new(SPILL_THRESHOLD),
            len: 0,
            cursor: 0,
        }
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn all(&mut self) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_at_cursor(&mut self) -> io::Result<Vec<u8>> {
        if self.cursor >= self.len {
            return Ok(Vec::new());
        }
        let want = ((self.len - self.cursor) as usize).min(CHUNK_SIZE);
        self.file.seek(SeekFrom::Start(self.cursor))?;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.cursor += filled as u64;
        Ok(buf)
    }

    fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.len = 0;
        self.cursor = 0;
        Ok(())
    }
}

/// Sequential rewound view over one channel's collected bytes,
/// independent of the facade cursor.
pub struct OutputReader<'a> {
    store: &'a mut Store,
    pos: u64,
}

impl Read for OutputReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.store.len {
            return Ok(0);
        }
        let want = buf.len().min((self.store.len - self.pos) as usize);
        self.store.file.seek(SeekFrom::Start(self.pos))?;
        let n = self.store.file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Pair of per-channel stores plus the idle clock.
///
/// In `output_disabled` mode the stores are not allocated and every
/// accessor fails with a logic error.
pub(crate) struct OutputBuffer {
    stores: Option<(Store, Store)>,
    last_output: Instant,
}

impl OutputBuffer {
    pub fn new(disabled: bool) -> Self {
        OutputBuffer {
            stores: if disabled {
                None
            } else {
                Some((Store::new(), Store::new()))
            },
            last_output: Instant::now(),
        }
    }

    fn store(&mut self, channel: Channel) -> Result<&mut Store> {
        let (out, err) = self
            .stores
            .as_mut()
            .ok_or_else(|| Error::logic("output collection is disabled"))?;
        Ok(match channel {
            Channel::Out => out,
            Channel::Err => err,
        })
    }

    pub fn add(&mut self, channel: Channel, data: &[u8]) -> Result<()> {
        self.last_output = Instant::now();
        self.store(channel)?.append(data)?;
        Ok(())
    }

    pub fn get(&mut self, channel: Channel) -> Result<Vec<u8>> {
        Ok(self.store(channel)?.all()?)
    }

    pub fn reader(&mut self, channel: Channel) -> Result<OutputReader<'_>> {
        Ok(OutputReader {
            store: self.store(channel)?,
            pos: 0,
        })
    }

    pub fn clear(&mut self, channel: Channel) -> Result<()> {
        self.store(channel)?.clear()?;
        Ok(())
    }

    /// Reads up to one chunk at the facade cursor and advances it.
    pub fn read_at_cursor(&mut self, channel: Channel) -> Result<Vec<u8>> {
        Ok(self.store(channel)?.read_at_cursor()?)
    }

    pub fn rewind_cursors(&mut self) {
        if let Some((out, err)) = self.stores.as_mut() {
            out.cursor = 0;
            err.cursor = 0;
        }
    }

    pub fn last_output(&self) -> Instant {
        self.last_output
    }

    /// Restarts the idle clock, e.g. when the child is spawned.
    pub fn touch(&mut self) {
        self.last_output = Instant::now();
    }

    #[cfg(test)]
    pub fn set_last_output(&mut self, at: Instant) {
        self.last_output = at;
    }

    pub fn is_disabled(&self) -> bool {
        self.stores.is_none()
    }
}
