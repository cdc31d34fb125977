/*!
 * This crate launches, supervises and communicates with child
 * processes over multiplexed pipes.
 *
 * A [`Command`] describes what to run (a pre-tokenized argument vector
 * or a shell string with `"${:NAME}"` placeholders), where, with which
 * environment, clocks and I/O mode. [`Command::supervise`] turns it
 * into a [`Supervisor`], which owns the child for its whole lifecycle:
 * it pumps a composable [`InputSource`] into the child's stdin with
 * non-blocking writes, drains stdout and stderr into seekable buffers
 * that spill to disk past a threshold, enforces a wall-clock and an
 * idle timeout, delivers signals, and reports exit status uniformly
 * across POSIX and Windows.
 *
 * ```no_run
 * use overseer::{Command, Channel, InputSource};
 *
 * fn main() -> overseer::Result<()> {
 *     let mut cmd = Command::shell("tr a-z A-Z");
 *     cmd.input(InputSource::of("hello"));
 *     let mut sup = cmd.supervise();
 *     sup.start()?;
 *     sup.wait()?;
 *     assert_eq!(sup.output_string(Channel::Out)?, "HELLO");
 *     Ok(())
 * }
 * ```
 *
 * # Platform support
 * _warning_: not every mode is supported by every platform. Terminal
 * modes (`tty`, `pty`) are POSIX only; use [`check`] to learn what the
 * host can do.
 */

mod command;
mod error;
mod input;
mod iter;
mod output;
mod pump;
mod supervisor;

mod check;
pub use check::{check, constrained_child, is_windows, supports_pty, supports_tty, CheckResult};

#[cfg(unix)]
pub(crate) mod posix;

#[cfg(windows)]
pub(crate) mod windows;

pub use command::Command;
pub use error::{Error, ErrorKind, Result};
pub use input::{InputChunk, InputSource, InputStream};
pub use iter::{Chunks, IterFlags};
pub use output::OutputReader;
pub use supervisor::{State, Supervisor};

#[cfg(unix)]
pub(crate) use crate::posix::{ChildHandle, PosixPipes as PlatformPipes};

#[cfg(windows)]
pub(crate) use crate::windows::{ChildHandle, WindowsPipes as PlatformPipes};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Read and write granularity of the multiplexing loop, in bytes.
pub const CHUNK_SIZE: usize = 8192;

/// Deadline handed to the readiness primitive on a blocking transfer.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default window between SIGTERM and the forced kill.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

/// Collected output stays in memory up to this size, then spills to
/// temp storage.
pub const SPILL_THRESHOLD: usize = 1024 * 1024;

/// Interval of the busy-wait loops (exit polling, kill grace).
pub(crate) const BUSY_WAIT: Duration = Duration::from_millis(1);

/// Output channel of a child process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Out,
    Err,
}

impl Channel {
    /// Stable string identifier, used as the iteration key.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Out => "out",
            Channel::Err => "err",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the child's standard streams are wired up.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Mode {
    /// Anonymous pipes on all three streams.
    Piped,
    /// All three streams bound to the controlling terminal. POSIX
    /// only.
    Tty,
    /// All three streams on a pseudo-terminal pair. POSIX only, where
    /// supported.
    Pty,
    /// Stdout and stderr to the null device; stdin stays a pipe. No
    /// output buffers are allocated, and the idle clock must stay
    /// disabled.
    OutputDisabled,
}

/// Platform-specific spawn flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SpawnOptions {
    /// POSIX: give the child its own session and process group.
    pub new_session: bool,
    /// Windows: extra `CreateProcess` creation flags, OR-ed into the
    /// forced set.
    pub creation_flags: u32,
    /// Windows: never show error-report dialogs for the child. Forced
    /// on.
    pub suppress_errors: bool,
    /// Windows: hand the composed line to the spawn primitive without
    /// an extra shell layer. Forced on.
    pub bypass_shell: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        SpawnOptions {
            new_session: false,
            creation_flags: 0,
            suppress_errors: true,
            bypass_shell: true,
        }
    }
}

/// Merged view of the child's exit facts. `-1` stands for "not
/// observed": a signal-terminated child has `exit_code == -1` at the
/// primitive level until the POSIX `128 + signal` convention or the
/// sideband record fills it in.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Status {
    pub running: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub term_signal: i32,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            running: false,
            exit_code: -1,
            signaled: false,
            term_signal: -1,
        }
    }
}

/// Raw answer of the platform's status primitive.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RawStatus {
    pub exit_code: i32,
    pub signaled: bool,
    pub term_signal: i32,
}
