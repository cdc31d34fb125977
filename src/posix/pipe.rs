use crate::error::Result;
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd,
};
use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
};

pub(crate) fn cvt(err: nix::Error) -> io::Error {
    match err.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, err),
    }
}

/// Owned file descriptor.
pub(crate) struct Fd(RawFd);

impl Fd {
    pub fn new(inner: RawFd) -> Self {
        Fd(inner)
    }

    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    pub fn try_clone(&self) -> Result<Fd> {
        Ok(Fd(unistd::dup(self.0)?))
    }

    pub fn set_nonblocking(&self) -> Result<()> {
        let bits = fcntl(self.0, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
        fcntl(self.0, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

pub(crate) struct ReadPipe {
    fd: Fd,
}

impl ReadPipe {
    pub fn new(fd: Fd) -> ReadPipe {
        ReadPipe { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw()
    }

    pub fn into_fd(self) -> Fd {
        self.fd
    }
}

impl io::Read for ReadPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unistd::read(self.fd.as_raw(), buf).map_err(cvt)
    }
}

pub(crate) struct WritePipe {
    fd: Fd,
}

impl WritePipe {
    pub fn new(fd: Fd) -> WritePipe {
        WritePipe { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw()
    }

    pub fn set_nonblocking(&self) -> Result<()> {
        self.fd.set_nonblocking()
    }

    pub fn into_fd(self) -> Fd {
        self.fd
    }
}

impl io::Write for WritePipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        unistd::write(self.fd.as_raw(), buf).map_err(cvt)
    }

    fn flush(&mut self) -> io::Result<()> {
        // pipe writes are not buffered
        Ok(())
    }
}

/// Anonymous pipe, close-on-exec on both ends. The child's copy is
/// re-installed with `dup2` after fork, which clears the flag.
pub(crate) fn pair() -> Result<(ReadPipe, WritePipe)> {
    let (read_end, write_end) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok((
        ReadPipe::new(Fd::new(read_end)),
        WritePipe::new(Fd::new(write_end)),
    ))
}
