//! Windows pipe strategy.
//!
//! Anonymous pipes to a console child cannot be multiplexed with a
//! readiness primitive, so stdout and stderr are redirected to two
//! uniquely-named temp files appended to the command line, and reads
//! drain those files at a tracked byte offset. Only stdin stays a real
//! pipe, switched to `PIPE_NOWAIT`.

mod pipe;
mod spawn;

pub(crate) use spawn::ChildHandle;

use crate::{
    command::{compose_windows, CommandSpec},
    error::{Error, Result},
    pump::InputPump,
    Channel, Mode, SpawnOptions, CHUNK_SIZE, POLL_TIMEOUT,
};
use pipe::{ReadPipe, WritePipe};
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    os::windows::io::AsRawHandle,
    path::Path,
};
use tempfile::NamedTempFile;
use winapi::um::{handleapi::SetHandleInformation, winbase::HANDLE_FLAG_INHERIT};

pub(crate) fn last_os_error() -> Error {
    let cause = io::Error::last_os_error();
    if cfg!(debug_assertions) {
        tracing::error!(error = %cause, backtrace = ?backtrace::Backtrace::new(), "win32 call failed");
    } else {
        tracing::error!(error = %cause, "win32 call failed");
    }
    Error::Io { cause }
}

/// Checks that a win32 call returned non-zero.
pub(crate) fn nonzero(ret: i32) -> Result<i32> {
    if ret != 0 {
        Ok(ret)
    } else {
        Err(last_os_error())
    }
}

pub(crate) struct WindowsPipes {
    command: Option<OsString>,
    extra_env: Vec<(OsString, OsString)>,
    stdin: Option<WritePipe>,
    child_stdin: Option<ReadPipe>,
    out_file: Option<NamedTempFile>,
    err_file: Option<NamedTempFile>,
    out_reader: Option<File>,
    err_reader: Option<File>,
    out_pos: u64,
    err_pos: u64,
}

impl WindowsPipes {
    pub fn new() -> Self {
        WindowsPipes {
            command: None,
            extra_env: Vec::new(),
            stdin: None,
            child_stdin: None,
            out_file: None,
            err_file: None,
            out_reader: None,
            err_reader: None,
            out_pos: 0,
            err_pos: 0,
        }
    }

    pub fn open(
        &mut self,
        spec: &CommandSpec,
        lookup: &mut dyn FnMut(&str) -> Option<String>,
        mode: Mode,
        _constrained: bool,
    ) -> Result<()> {
        self.reset();
        match mode {
            Mode::Tty | Mode::Pty => {
                return Err(Error::invalid(
                    "terminal modes are not supported on Windows",
                ));
            }
            Mode::Piped | Mode::OutputDisabled => {}
        }
        let composed = compose_windows(spec, lookup)?;
        self.extra_env = composed
            .extra_env
            .into_iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect();

        let (child_read, parent_write) = pipe::make()?;
        parent_write.clear_inherit()?;
        parent_write.set_nonblocking()?;
        self.stdin = Some(parent_write);
        self.child_stdin = Some(child_read);

        let redirect = if mode == Mode::OutputDisabled {
            " 1>NUL 2>NUL".to_string()
        } else {
            let out = named_redirect_file(".out")?;
            let err = named_redirect_file(".err")?;
            let redirect = format!(
                " 1>\"{}\" 2>\"{}\"",
                out.path().display(),
                err.path().display()
            );
            self.out_reader = Some(File::open(out.path())?);
            self.err_reader = Some(File::open(err.path())?);
            self.out_file = Some(out);
            self.err_file = Some(err);
            redirect
        };
        let mut line = OsString::from("cmd /V:ON /E:ON /D /C (");
        line.push(&composed.line);
        line.push(")");
        line.push(&redirect);
        self.command = Some(line);
        Ok(())
    }

    /// Variables the composed cmd line expands with `!VARn!`; the
    /// supervisor injects them around the spawn.
    pub fn extra_env(&self) -> Vec<(OsString, OsString)> {
        self.extra_env.clone()
    }

    pub fn spawn(&mut self, cwd: Option<&Path>, options: &SpawnOptions) -> Result<ChildHandle> {
        let command = self
            .command
            .clone()
            .ok_or_else(|| Error::logic("pipes are not opened"))?;
        let child_stdin = self
            .child_stdin
            .take()
            .ok_or_else(|| Error::logic("pipes are not opened"))?;
        // the spawn primitive itself gets the NUL device; output goes
        // through the redirections appended to the command line
        let null_out = inheritable_null()?;
        let null_err = inheritable_null()?;
        tracing::debug!(command = ?command, "spawning through cmd");
        let child = spawn::spawn_cmdline(
            &command,
            child_stdin.raw(),
            null_out.as_raw_handle(),
            null_err.as_raw_handle(),
            cwd,
            options,
        )?;
        drop(child_stdin);
        Ok(child)
    }

    /// The pipe set proper is just stdin; the temp files live until
    /// the final drain.
    pub fn pipes_open(&self) -> bool {
        self.stdin.is_some()
    }

    pub fn transfer(
        &mut self,
        pump: &mut InputPump,
        blocking: bool,
        _closing: bool,
    ) -> Result<Vec<(Channel, Vec<u8>)>> {
        let mut chunks = Vec::new();
        let mut progressed = false;
        let mut stdin_done = false;
        if let Some(stdin) = self.stdin.as_mut() {
            match pump.write_to(stdin) {
                Ok(progress) => {
                    stdin_done = progress.end;
                    progressed |= progress.wrote > 0;
                }
                Err(Error::Io { cause }) if cause.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!("child closed its stdin before the input ended");
                    stdin_done = true;
                }
                Err(e) => return Err(e),
            }
        }
        if stdin_done {
            self.stdin = None;
        }
        progressed |= self.drain_file(Channel::Out, &mut chunks)?;
        progressed |= self.drain_file(Channel::Err, &mut chunks)?;
        if blocking && !progressed {
            std::thread::sleep(POLL_TIMEOUT);
        }
        Ok(chunks)
    }

    fn drain_file(
        &mut self,
        channel: Channel,
        chunks: &mut Vec<(Channel, Vec<u8>)>,
    ) -> Result<bool> {
        let (reader, pos) = match channel {
            Channel::Out => (self.out_reader.as_mut(), &mut self.out_pos),
            Channel::Err => (self.err_reader.as_mut(), &mut self.err_pos),
        };
        let reader = match reader {
            Some(r) => r,
            None => return Ok(false),
        };
        reader.seek(SeekFrom::Start(*pos))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        *pos += n as u64;
        buf.truncate(n);
        chunks.push((channel, buf));
        Ok(true)
    }

    /// Reads the remaining tail of both files and releases them; the
    /// temp files are unlinked as they drop.
    pub fn final_drain(&mut self, _pump: &mut InputPump) -> Result<Vec<(Channel, Vec<u8>)>> {
        let mut chunks = Vec::new();
        loop {
            let mut got = false;
            got |= self.drain_file(Channel::Out, &mut chunks)?;
            got |= self.drain_file(Channel::Err, &mut chunks)?;
            if !got {
                break;
            }
        }
        self.close();
        Ok(chunks)
    }

    pub fn take_sideband_line(&mut self) -> Option<i32> {
        None
    }

    pub fn read_sideband_line(
        &mut self,
        _timeout: std::time::Duration,
    ) -> Result<Option<i32>> {
        Ok(None)
    }

    pub fn close(&mut self) {
        self.stdin = None;
        self.child_stdin = None;
        self.out_reader = None;
        self.err_reader = None;
        self.out_file = None;
        self.err_file = None;
    }

    pub fn reset(&mut self) {
        self.close();
        self.command = None;
        self.extra_env.clear();
        self.out_pos = 0;
        self.err_pos = 0;
    }
}

fn named_redirect_file(suffix: &str) -> Result<NamedTempFile> {
    Ok(tempfile::Builder::new()
        .prefix("overseer-")
        .suffix(suffix)
        .tempfile()?)
}

fn inheritable_null() -> Result<File> {
    let file = OpenOptions::new().write(true).open("NUL")?;
    nonzero(unsafe {
        SetHandleInformation(
            file.as_raw_handle() as _,
            HANDLE_FLAG_INHERIT,
            HANDLE_FLAG_INHERIT,
        )
    })?;
    Ok(file)
}
