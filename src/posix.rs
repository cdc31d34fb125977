mod pipe;
mod spawn;

pub(crate) use spawn::{raw_pid, send_signal, ChildHandle};

use crate::{
    command::{compose_posix, CommandSpec},
    error::{Error, Result},
    pump::InputPump,
    Channel, Mode, SpawnOptions, CHUNK_SIZE, POLL_TIMEOUT,
};
use nix::poll::{poll, PollFd, PollFlags};
use pipe::{Fd, ReadPipe, WritePipe};
use std::{
    collections::VecDeque,
    ffi::OsString,
    fs::OpenOptions,
    io::{self, Read},
    os::unix::io::IntoRawFd,
    path::Path,
    time::{Duration, Instant},
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Endpoint {
    Stdin,
    Stdout,
    Stderr,
    Sideband,
}

/// POSIX descriptor layout and transfer engine.
///
/// Owns the parent side of the child's pipes, composes the final
/// `/bin/sh -c` command string, and multiplexes all endpoints with
/// `poll(2)`. When the capability oracle reports a constrained-child
/// runtime the command is wrapped so the wrapping shell publishes the
/// child pid and exit code on fd 3.
pub(crate) struct PosixPipes {
    command: Option<String>,
    stdin: Option<WritePipe>,
    stdout: Option<ReadPipe>,
    stderr: Option<ReadPipe>,
    sideband: Option<ReadPipe>,
    sideband_buf: Vec<u8>,
    sideband_lines: VecDeque<i32>,
    child_fds: Option<spawn::ChildStdio>,
    tty: bool,
}

impl PosixPipes {
    pub fn new() -> Self {
        PosixPipes {
            command: None,
            stdin: None,
            stdout: None,
            stderr: None,
            sideband: None,
            sideband_buf: Vec::new(),
            sideband_lines: VecDeque::new(),
            child_fds: None,
            tty: false,
        }
    }

    /// Builds the descriptor table for `mode` and composes the final
    /// command string.
    pub fn open(
        &mut self,
        spec: &CommandSpec,
        lookup: &mut dyn FnMut(&str) -> Option<String>,
        mode: Mode,
        constrained: bool,
    ) -> Result<()> {
        self.reset();
        let mut command = compose_posix(spec, lookup)?;
        let mut fds = spawn::ChildStdio {
            stdin: None,
            stdout: None,
            stderr: None,
            sideband: None,
        };
        match mode {
            Mode::Piped | Mode::OutputDisabled => {
                let (child_in, parent_in) = pipe::pair()?;
                parent_in.set_nonblocking()?;
                fds.stdin = Some(child_in.into_fd());
                self.stdin = Some(parent_in);
                if mode == Mode::Piped {
                    let (parent_out, child_out) = pipe::pair()?;
                    let (parent_err, child_err) = pipe::pair()?;
                    fds.stdout = Some(child_out.into_fd());
                    fds.stderr = Some(child_err.into_fd());
                    self.stdout = Some(parent_out);
                    self.stderr = Some(parent_err);
                } else {
                    fds.stdout = Some(open_null()?);
                    fds.stderr = Some(open_null()?);
                }
            }
            Mode::Tty => {
                fds.stdin = Some(open_tty(false)?);
                fds.stdout = Some(open_tty(true)?);
                fds.stderr = Some(open_tty(true)?);
                self.tty = true;
            }
            Mode::Pty => {
                let pty = nix::pty::openpty(None, None)?;
                let master = Fd::new(pty.master);
                let slave = Fd::new(pty.slave);
                master.set_nonblocking()?;
                let master_write = master.try_clone()?;
                let slave_out = slave.try_clone()?;
                let slave_err = slave.try_clone()?;
                fds.stdin = Some(slave);
                fds.stdout = Some(slave_out);
                fds.stderr = Some(slave_err);
                // everything the child prints arrives on the master
                self.stdout = Some(ReadPipe::new(master));
                self.stdin = Some(WritePipe::new(master_write));
            }
        }
        if constrained && !self.tty {
            let (parent_side, child_side) = pipe::pair()?;
            let parent_fd = parent_side.into_fd();
            parent_fd.set_nonblocking()?;
            self.sideband = Some(ReadPipe::new(parent_fd));
            fds.sideband = Some(child_side.into_fd());
            command = wrap_constrained(&command);
        }
        self.command = Some(command);
        self.child_fds = Some(fds);
        Ok(())
    }

    pub fn spawn(&mut self, cwd: Option<&Path>, options: &SpawnOptions) -> Result<ChildHandle> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| Error::logic("pipes are not opened"))?;
        let fds = self
            .child_fds
            .take()
            .ok_or_else(|| Error::logic("pipes are not opened"))?;
        tracing::debug!(command = %command, "spawning /bin/sh -c");
        spawn::spawn_shell(command, fds, cwd, options)
    }

    /// Environment variables the composed command relies on. The POSIX
    /// shell gets everything through quoting, so there are none.
    pub fn extra_env(&self) -> Vec<(OsString, OsString)> {
        Vec::new()
    }

    pub fn pipes_open(&self) -> bool {
        self.stdin.is_some()
            || self.stdout.is_some()
            || self.stderr.is_some()
            || self.sideband.is_some()
    }

    /// One multiplexing pass: wait for readiness (up to the readiness
    /// deadline when `blocking`), pump stdin, drain readable outputs.
    /// Readiness failures other than EINTR drop the pipes and let the
    /// child continue.
    pub fn transfer(
        &mut self,
        pump: &mut InputPump,
        blocking: bool,
        closing: bool,
    ) -> Result<Vec<(Channel, Vec<u8>)>> {
        let mut chunks = Vec::new();
        let mut fds = Vec::new();
        let mut tags = Vec::new();
        if let Some(stdin) = &self.stdin {
            if !pump.is_finished() {
                fds.push(PollFd::new(stdin.fd(), PollFlags::POLLOUT));
                tags.push(Endpoint::Stdin);
            }
        }
        let read_ends = [
            (self.stdout.as_ref(), Endpoint::Stdout),
            (self.stderr.as_ref(), Endpoint::Stderr),
            (self.sideband.as_ref(), Endpoint::Sideband),
        ];
        for (pipe, tag) in &read_ends {
            if let Some(pipe) = pipe {
                fds.push(PollFd::new(pipe.fd(), PollFlags::POLLIN));
                tags.push(*tag);
            }
        }
        if fds.is_empty() {
            if blocking {
                // nothing to multiplex; honor the readiness deadline
                std::thread::sleep(POLL_TIMEOUT);
            }
            return Ok(chunks);
        }
        let timeout = if blocking {
            POLL_TIMEOUT.as_millis() as i32
        } else {
            0
        };
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(ref e) if e.as_errno() == Some(nix::errno::Errno::EINTR) => return Ok(chunks),
            Err(e) => {
                tracing::warn!(error = %e, "readiness poll failed, dropping pipes");
                self.close();
                return Ok(chunks);
            }
        }
        let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        for (fd, tag) in fds.iter().zip(&tags) {
            let revents = fd.revents().unwrap_or_else(PollFlags::empty);
            match tag {
                Endpoint::Stdin => {
                    if revents
                        .intersects(PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR)
                    {
                        self.pump_stdin(pump)?;
                    }
                }
                Endpoint::Stdout if revents.intersects(wake) => {
                    self.drain_read(Endpoint::Stdout, closing, &mut chunks)?;
                }
                Endpoint::Stderr if revents.intersects(wake) => {
                    self.drain_read(Endpoint::Stderr, closing, &mut chunks)?;
                }
                Endpoint::Sideband if revents.intersects(wake) => {
                    self.drain_read(Endpoint::Sideband, closing, &mut chunks)?;
                }
                _ => {}
            }
        }
        Ok(chunks)
    }

    fn pump_stdin(&mut self, pump: &mut InputPump) -> Result<()> {
        let mut finished = false;
        if let Some(stdin) = self.stdin.as_mut() {
            match pump.write_to(stdin) {
                Ok(progress) => finished = progress.end,
                Err(Error::Io { cause }) if cause.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!("child closed its stdin before the input ended");
                    finished = true;
                }
                Err(e) => return Err(e),
            }
        }
        if finished {
            self.stdin = None;
        }
        Ok(())
    }

    fn drain_read(
        &mut self,
        endpoint: Endpoint,
        closing: bool,
        chunks: &mut Vec<(Channel, Vec<u8>)>,
    ) -> Result<()> {
        let slot = match endpoint {
            Endpoint::Stdout => &mut self.stdout,
            Endpoint::Stderr => &mut self.stderr,
            Endpoint::Sideband => &mut self.sideband,
            Endpoint::Stdin => return Ok(()),
        };
        let mut at_eof = false;
        let mut sideband_data = None;
        if let Some(pipe) = slot.as_mut() {
            let mut buf = vec![0u8; CHUNK_SIZE];
            match pipe.read(&mut buf) {
                Ok(0) => at_eof = true,
                Ok(n) => {
                    buf.truncate(n);
                    match endpoint {
                        Endpoint::Stdout => chunks.push((Channel::Out, buf)),
                        Endpoint::Stderr => chunks.push((Channel::Err, buf)),
                        Endpoint::Sideband => sideband_data = Some(buf),
                        Endpoint::Stdin => {}
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                // a pty master reports EIO once the slave side is gone
                Err(ref e) if e.raw_os_error() == Some(libc::EIO) => at_eof = true,
                Err(e) => {
                    tracing::warn!(error = %e, "pipe read failed, dropping the pipe");
                    at_eof = true;
                }
            }
        }
        if at_eof && closing {
            *slot = None;
        }
        if let Some(data) = sideband_data {
            self.sideband_buf.extend_from_slice(&data);
            self.parse_sideband();
        }
        Ok(())
    }

    fn parse_sideband(&mut self) {
        while let Some(pos) = self.sideband_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.sideband_buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            match text.trim().parse::<i32>() {
                Ok(v) => self.sideband_lines.push_back(v),
                Err(_) => {
                    if !text.trim().is_empty() {
                        tracing::warn!(line = %text, "unparseable sideband line");
                    }
                }
            }
        }
    }

    pub fn take_sideband_line(&mut self) -> Option<i32> {
        self.sideband_lines.pop_front()
    }

    /// Blocks up to `timeout` for the next sideband line. Used right
    /// after spawn to learn the wrapped child's pid.
    pub fn read_sideband_line(&mut self, timeout: Duration) -> Result<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = self.take_sideband_line() {
                return Ok(Some(v));
            }
            if self.sideband.is_none() || Instant::now() >= deadline {
                return Ok(None);
            }
            let fd = match &self.sideband {
                Some(p) => p.fd(),
                None => return Ok(None),
            };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, 10) {
                Ok(_) => {}
                Err(ref e) if e.as_errno() == Some(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            let mut sink = Vec::new();
            self.drain_read(Endpoint::Sideband, true, &mut sink)?;
        }
    }

    /// Collects whatever is still buffered in the kernel pipes after
    /// the child died, then releases every descriptor.
    pub fn final_drain(&mut self, pump: &mut InputPump) -> Result<Vec<(Channel, Vec<u8>)>> {
        let mut chunks = Vec::new();
        while self.pipes_open() {
            let pass = self.transfer(pump, false, true)?;
            if pass.is_empty() {
                break;
            }
            chunks.extend(pass);
        }
        self.close();
        Ok(chunks)
    }

    pub fn close(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.sideband = None;
        self.child_fds = None;
    }

    pub fn reset(&mut self) {
        self.close();
        self.command = None;
        self.sideband_buf.clear();
        self.sideband_lines.clear();
        self.tty = false;
    }
}

fn open_null() -> Result<Fd> {
    let file = OpenOptions::new().write(true).open("/dev/null")?;
    Ok(Fd::new(file.into_raw_fd()))
}

fn open_tty(write: bool) -> Result<Fd> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .open("/dev/tty")?;
    Ok(Fd::new(file.into_raw_fd()))
}

/// Wraps the command so the wrapping shell reports `{pid, exit code}`
/// on fd 3, with the child's stdin rebound through fd 4. Used when the
/// runtime cannot observe signal termination directly.
fn wrap_constrained(command: &str) -> String {
    format!(
        "exec 4<&0; ( {} ) <&4 4<&- & echo $! >&3; wait $!; st=$?; echo $st >&3; exit $st",
        command
    )
}

/// Probes whether a throwaway child can be spawned against `/dev/tty`.
pub(crate) fn probe_tty() -> bool {
    let stdio = (|| -> Result<spawn::ChildStdio> {
        Ok(spawn::ChildStdio {
            stdin: Some(open_tty(false)?),
            stdout: Some(open_tty(true)?),
            stderr: Some(open_tty(true)?),
            sideband: None,
        })
    })();
    match stdio {
        Ok(stdio) => probe_spawn(stdio),
        Err(_) => false,
    }
}

/// Probes whether a pseudo-terminal pair can host a child.
pub(crate) fn probe_pty() -> bool {
    let stdio = (|| -> Result<spawn::ChildStdio> {
        let pty = nix::pty::openpty(None, None)?;
        let _master = Fd::new(pty.master);
        let slave = Fd::new(pty.slave);
        let out = slave.try_clone()?;
        let err = slave.try_clone()?;
        Ok(spawn::ChildStdio {
            stdin: Some(slave),
            stdout: Some(out),
            stderr: Some(err),
            sideband: None,
        })
    })();
    match stdio {
        Ok(stdio) => probe_spawn(stdio),
        Err(_) => false,
    }
}

fn probe_spawn(stdio: spawn::ChildStdio) -> bool {
    match spawn::spawn_shell(":", stdio, None, &SpawnOptions::default()) {
        Ok(handle) => {
            let _ = handle.wait_blocking();
            true
        }
        Err(_) => false,
    }
}
