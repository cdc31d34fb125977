use super::pipe::{self, Fd};
use crate::{
    error::{Error, Result},
    RawStatus, SpawnOptions,
};
use nix::{
    fcntl::{fcntl, FcntlArg},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, ForkResult, Pid},
};
use std::{
    convert::TryFrom,
    ffi::{CStr, CString},
    io::Read,
    os::unix::io::RawFd,
    path::Path,
};

/// Descriptors the child receives as fds 0..=3. Dropped (closed) in
/// the parent once the fork has happened.
pub(crate) struct ChildStdio {
    pub stdin: Option<Fd>,
    pub stdout: Option<Fd>,
    pub stderr: Option<Fd>,
    pub sideband: Option<Fd>,
}

pub(crate) struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking status probe.
    pub fn poll(&self) -> Result<Option<RawStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(RawStatus {
                exit_code: code,
                signaled: false,
                term_signal: -1,
            })),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(RawStatus {
                exit_code: -1,
                signaled: true,
                term_signal: sig as i32,
            })),
            // stopped/continued children are still running
            Ok(_) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn signal(&self, sig: i32) -> Result<()> {
        send_signal(self.pid, sig)
    }

    /// Blocking reap, used by the capability probes.
    pub fn wait_blocking(&self) -> Result<()> {
        waitpid(self.pid, None)?;
        Ok(())
    }
}

pub(crate) fn send_signal(pid: Pid, sig: i32) -> Result<()> {
    if sig == 0 {
        kill(pid, None)?;
        return Ok(());
    }
    let signal =
        Signal::try_from(sig).map_err(|_| Error::invalid(format!("unknown signal {}", sig)))?;
    kill(pid, signal)?;
    Ok(())
}

pub(crate) fn raw_pid(pid: i32) -> Pid {
    Pid::from_raw(pid)
}

/// Forks and executes `/bin/sh -c <command>` with the given stdio
/// layout. Exec failures in the child are reported back through a
/// close-on-exec pipe, so a successful return means the shell is
/// actually running.
pub(crate) fn spawn_shell(
    command: &str,
    stdio: ChildStdio,
    cwd: Option<&Path>,
    options: &SpawnOptions,
) -> Result<ChildHandle> {
    let command =
        CString::new(command).map_err(|_| Error::invalid("command contains a NUL byte"))?;
    let sh = CString::new("/bin/sh").map_err(|_| Error::invalid("bad shell path"))?;
    let argv0 = CString::new("sh").map_err(|_| Error::invalid("bad shell path"))?;
    let dash_c = CString::new("-c").map_err(|_| Error::invalid("bad shell path"))?;

    let (mut fail_read, fail_write) = pipe::pair()?;

    let fork_result = unsafe { unistd::fork() }?;
    match fork_result {
        ForkResult::Parent { child } => {
            drop(stdio);
            drop(fail_write);
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < buf.len() {
                match fail_read.read(&mut buf[got..]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if got == buf.len() {
                // exec never happened; reap the stillborn child
                let _ = waitpid(child, None);
                let code = i32::from_le_bytes(buf);
                return Err(Error::Io {
                    cause: std::io::Error::from_raw_os_error(code),
                });
            }
            Ok(ChildHandle { pid: child })
        }
        ForkResult::Child => {
            let argv: [&CStr; 3] = [&argv0, &dash_c, &command];
            let code = match exec_child(&sh, &argv, &stdio, cwd, options) {
                Err(e) => e.as_errno().map(|e| e as i32).unwrap_or(-1),
                Ok(_) => unreachable!(),
            };
            let bytes = code.to_le_bytes();
            unsafe {
                libc::write(
                    fail_write.fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                );
                libc::_exit(127);
            }
        }
    }
}

/// Moves a descriptor above the stdio range so `dup2` into 0..=3
/// cannot clobber a source we still need.
fn clear_of_stdio(fd: RawFd) -> nix::Result<RawFd> {
    if fd > 3 {
        Ok(fd)
    } else {
        fcntl(fd, FcntlArg::F_DUPFD(10))
    }
}

fn exec_child(
    sh: &CStr,
    argv: &[&CStr; 3],
    stdio: &ChildStdio,
    cwd: Option<&Path>,
    options: &SpawnOptions,
) -> nix::Result<std::convert::Infallible> {
    let targets: [(&Option<Fd>, RawFd); 4] = [
        (&stdio.stdin, 0),
        (&stdio.stdout, 1),
        (&stdio.stderr, 2),
        (&stdio.sideband, 3),
    ];
    let mut moved: [Option<RawFd>; 4] = [None; 4];
    for (i, (fd, _)) in targets.iter().enumerate() {
        if let Some(fd) = fd {
            moved[i] = Some(clear_of_stdio(fd.as_raw())?);
        }
    }
    for (i, (_, target)) in targets.iter().enumerate() {
        if let Some(src) = moved[i] {
            unistd::dup2(src, *target)?;
        }
    }
    if options.new_session {
        unistd::setsid()?;
    }
    if let Some(dir) = cwd {
        unistd::chdir(dir)?;
    }
    // the Rust runtime ignores SIGPIPE; the child must not inherit that
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
    unistd::execv(sh, &argv[..])
}
