use crate::{
    check,
    command::{Command, CommandSpec},
    error::{Error, Result},
    input::InputSource,
    iter::{Chunks, IterFlags, IterState},
    output::{OutputBuffer, OutputReader},
    pump::InputPump,
    Channel, ChildHandle, Mode, PlatformPipes, RawStatus, SpawnOptions, Status, BUSY_WAIT,
    POLL_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

const TERM_SIGNAL: i32 = 15;
const KILL_SIGNAL: i32 = 9;
/// How long an escalation step waits before concluding the child
/// ignored it.
const ESCALATE_WAIT: Duration = Duration::from_millis(100);

/// Lifecycle of a supervised child.
///
/// `Terminated` is absorbing: a finished supervisor is re-run by
/// cloning it, which yields an independent `Ready` instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum State {
    Ready,
    Started,
    Waiting,
    Terminated,
}

/// Exit facts learned outside the spawn primitive: the pid published
/// on the fd-3 sideband, the exit code echoed there, and any signal
/// this supervisor delivered itself.
#[derive(Debug, Copy, Clone)]
struct FallbackRecord {
    pid: Option<i32>,
    exit_code: Option<i32>,
    signaled: bool,
    term_signal: i32,
}

impl Default for FallbackRecord {
    fn default() -> Self {
        FallbackRecord {
            pid: None,
            exit_code: None,
            signaled: false,
            term_signal: -1,
        }
    }
}

/// Supervises one child process: spawns it, pumps its stdin from an
/// [`InputSource`], drains stdout/stderr into an in-memory buffer
/// (spilling to disk past a threshold), enforces the wall-clock and
/// idle clocks, delivers signals, and harvests the exit status.
///
/// Built from a [`Command`]; see [`Command::supervise`].
pub struct Supervisor {
    spec: CommandSpec,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, Option<OsString>)>,
    timeout: Duration,
    idle_timeout: Duration,
    mode: Mode,
    options: SpawnOptions,
    input: InputSource,

    state: State,
    pipes: PlatformPipes,
    pump: InputPump,
    output: OutputBuffer,
    child: Option<ChildHandle>,
    child_pid: Option<u32>,
    status: Status,
    fallback: FallbackRecord,
    latest_signal: Option<i32>,
    started_at: Option<Instant>,
    iter: IterState,
}

type Callback<'a> = &'a mut dyn FnMut(&mut Supervisor, Channel, &[u8]) -> Result<()>;

impl Supervisor {
    pub fn new(command: Command) -> Supervisor {
        let input = command.input.unwrap_or_else(InputSource::sealed);
        Supervisor {
            spec: command.spec,
            cwd: command.cwd,
            env: command.env,
            timeout: command.timeout,
            idle_timeout: command.idle_timeout,
            mode: command.mode,
            options: command.options,
            pump: InputPump::new(input.clone()),
            input,
            state: State::Ready,
            pipes: PlatformPipes::new(),
            output: OutputBuffer::new(command.mode == Mode::OutputDisabled),
            child: None,
            child_pid: None,
            status: Status::default(),
            fallback: FallbackRecord::default(),
            latest_signal: None,
            started_at: None,
            iter: IterState::new(),
        }
    }

    // -- configuration ------------------------------------------------

    fn ensure_not_running(&self) -> Result<()> {
        if self.is_running() {
            Err(Error::runtime(
                "configuration is frozen while the process runs",
            ))
        } else {
            Ok(())
        }
    }

    pub fn set_timeout(&mut self, limit: Duration) -> Result<()> {
        self.ensure_not_running()?;
        self.timeout = limit;
        Ok(())
    }

    pub fn set_idle_timeout(&mut self, limit: Duration) -> Result<()> {
        self.ensure_not_running()?;
        self.idle_timeout = limit;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.ensure_not_running()?;
        self.mode = mode;
        self.output = OutputBuffer::new(mode == Mode::OutputDisabled);
        Ok(())
    }

    pub fn set_input(&mut self, source: InputSource) -> Result<()> {
        self.ensure_not_running()?;
        self.pump = InputPump::new(source.clone());
        self.input = source;
        Ok(())
    }

    /// Handle to the child's input; the caller may append to it while
    /// the child runs.
    pub fn input(&self) -> InputSource {
        self.input.clone()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    // -- lifecycle ----------------------------------------------------

    fn validate_mode(&self) -> Result<()> {
        if check::is_windows() && matches!(self.mode, Mode::Tty | Mode::Pty) {
            return Err(Error::invalid(
                "terminal modes are not supported on Windows",
            ));
        }
        if self.mode == Mode::Tty && !check::supports_tty() {
            return Err(Error::invalid("no usable controlling terminal"));
        }
        if self.mode == Mode::Pty && !check::supports_pty() {
            return Err(Error::invalid(
                "pseudo-terminal devices are not available",
            ));
        }
        if self.mode == Mode::OutputDisabled && self.idle_timeout > Duration::from_secs(0) {
            return Err(Error::logic(
                "an idle timeout cannot be combined with disabled output",
            ));
        }
        Ok(())
    }

    /// Spawns the child. Only legal in `Ready`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Ready => {}
            State::Terminated => {
                return Err(Error::logic(
                    "a terminated supervisor cannot be restarted; clone the configuration",
                ));
            }
            _ => return Err(Error::logic("process is already running")),
        }
        self.validate_mode()?;
        self.status = Status::default();
        self.fallback = FallbackRecord::default();
        self.latest_signal = None;
        self.pump = InputPump::new(self.input.clone());
        self.iter.cache.clear();
        self.output.rewind_cursors();

        let constrained = check::constrained_child() && !check::is_windows();
        let env_table = self.env.clone();
        let mut lookup = move |name: &str| -> Option<String> {
            for (key, value) in env_table.iter().rev() {
                if key.as_os_str() == OsStr::new(name) {
                    return value.as_ref().and_then(|v| v.to_str().map(str::to_string));
                }
            }
            std::env::var(name).ok()
        };
        let spec = self.spec.clone();
        self.pipes.open(&spec, &mut lookup, self.mode, constrained)?;

        // portable env passing goes through the process environment:
        // save, set, spawn, restore, all in this single-threaded section
        let saved = install_env(&self.env, &self.pipes.extra_env());
        let spawned = self.pipes.spawn(self.cwd.as_deref(), &self.options);
        restore_env(saved);
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "spawn failed");
                self.pipes.close();
                return Err(Error::runtime("Unable to launch a new process."));
            }
        };
        self.child_pid = Some(child.pid());
        tracing::debug!(pid = child.pid(), "child started");
        self.child = Some(child);
        self.state = State::Started;
        self.status.running = true;
        self.started_at = Some(Instant::now());
        self.output.touch();
        if constrained {
            match self.pipes.read_sideband_line(POLL_TIMEOUT)? {
                Some(pid) => self.fallback.pid = Some(pid),
                None => tracing::warn!("wrapping shell did not report the child pid"),
            }
        }
        if self.mode == Mode::Tty {
            // probing a tty-bound child would block on the terminal
            return Ok(());
        }
        self.update_status(false)?;
        self.check_timeout()?;
        Ok(())
    }

    /// Runs the child to completion, draining output.
    pub fn wait(&mut self) -> Result<i32> {
        self.wait_impl(None)
    }

    /// Like [`wait`](Self::wait), delivering every output chunk to
    /// `callback` as it arrives. The callback gets the supervisor back
    /// so it can kill or signal the child mid-run.
    pub fn wait_with<F>(&mut self, mut callback: F) -> Result<i32>
    where
        F: FnMut(&mut Supervisor, Channel, &[u8]) -> Result<()>,
    {
        self.wait_impl(Some(&mut callback))
    }

    fn wait_impl(&mut self, mut callback: Option<Callback<'_>>) -> Result<i32> {
        if self.state == State::Ready {
            return Err(Error::logic("wait called before start"));
        }
        if self.mode == Mode::OutputDisabled && callback.is_some() {
            return Err(Error::runtime(
                "output callbacks require output collection",
            ));
        }
        if self.state != State::Terminated {
            self.state = State::Waiting;
        }
        while self.state == State::Waiting && self.pipes.pipes_open() {
            self.check_timeout()?;
            let chunks = self.transfer_tick(true)?;
            self.deliver(chunks, &mut callback)?;
        }
        while self.state != State::Terminated {
            self.check_timeout()?;
            self.refresh_raw_status()?;
            if !self.status.running {
                self.update_status(false)?;
                break;
            }
            let chunks = self.transfer_tick(false)?;
            self.deliver(chunks, &mut callback)?;
            thread::sleep(BUSY_WAIT);
        }
        if self.status.signaled && self.latest_signal != Some(self.status.term_signal) {
            return Err(Error::runtime(format!(
                "signaled with signal {}",
                self.status.term_signal
            )));
        }
        Ok(self.status.exit_code)
    }

    fn deliver(
        &mut self,
        chunks: Vec<(Channel, Vec<u8>)>,
        callback: &mut Option<Callback<'_>>,
    ) -> Result<()> {
        if let Some(cb) = callback.as_mut() {
            for (channel, data) in &chunks {
                cb(self, *channel, data)?;
            }
        }
        Ok(())
    }

    /// One transfer pass: route fresh chunks into the output buffer
    /// and fold sideband lines into the fallback record.
    fn transfer_tick(&mut self, blocking: bool) -> Result<Vec<(Channel, Vec<u8>)>> {
        let closing = !self.pipes.pipes_open() || !check::is_windows();
        let chunks = self.pipes.transfer(&mut self.pump, blocking, closing)?;
        self.absorb(&chunks)?;
        Ok(chunks)
    }

    fn absorb(&mut self, chunks: &[(Channel, Vec<u8>)]) -> Result<()> {
        for (channel, data) in chunks {
            if !self.output.is_disabled() {
                self.output.add(*channel, data)?;
            }
        }
        self.consume_sideband();
        Ok(())
    }

    fn consume_sideband(&mut self) {
        while let Some(value) = self.pipes.take_sideband_line() {
            if self.fallback.pid.is_none() {
                self.fallback.pid = Some(value);
            } else {
                self.fallback.exit_code = Some(value);
            }
        }
    }

    /// Probes the child's status. With `blocking`, a still-running
    /// child gets one blocking transfer pass first. The fallback
    /// record is merged over the primitive's answer; a dead child
    /// moves the supervisor to `Terminated`.
    pub fn update_status(&mut self, blocking: bool) -> Result<()> {
        if !matches!(self.state, State::Started | State::Waiting) {
            return Ok(());
        }
        self.refresh_raw_status()?;
        if self.status.running && blocking {
            self.transfer_tick(true)?;
            self.refresh_raw_status()?;
        }
        self.merge_fallback();
        if !self.status.running {
            self.finalize()?;
        }
        Ok(())
    }

    fn refresh_raw_status(&mut self) -> Result<()> {
        if !self.status.running {
            return Ok(());
        }
        let raw = match &self.child {
            Some(child) => child.poll()?,
            None => return Ok(()),
        };
        if let Some(raw) = raw {
            let masked = if check::constrained_child() && !check::is_windows() {
                // a constrained runtime cannot see how the wrapper
                // exited; everything comes from the sideband
                RawStatus {
                    exit_code: -1,
                    signaled: false,
                    term_signal: -1,
                }
            } else {
                raw
            };
            self.status = Status {
                running: false,
                exit_code: masked.exit_code,
                signaled: masked.signaled,
                term_signal: masked.term_signal,
            };
        }
        Ok(())
    }

    /// Sideband facts win wherever the primitive reported `-1`.
    fn merge_fallback(&mut self) {
        if self.status.running || self.status.exit_code != -1 {
            return;
        }
        if self.fallback.signaled {
            self.status.signaled = true;
            if self.status.term_signal <= 0 {
                self.status.term_signal = self.fallback.term_signal;
            }
        }
        if let Some(code) = self.fallback.exit_code {
            if code != -1 {
                self.status.exit_code = code;
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        let chunks = self.pipes.final_drain(&mut self.pump)?;
        self.absorb(&chunks)?;
        self.merge_fallback();
        if self.status.exit_code == -1 && self.status.signaled && self.status.term_signal > 0 {
            // POSIX convention for signal deaths
            self.status.exit_code = 128 + self.status.term_signal;
        }
        self.child = None;
        self.state = State::Terminated;
        tracing::debug!(
            exit_code = self.status.exit_code,
            signaled = self.status.signaled,
            "child terminated"
        );
        Ok(())
    }

    /// Kills the child if either clock has expired. The earlier
    /// deadline decides which error is raised.
    pub fn check_timeout(&mut self) -> Result<()> {
        if !self.status.running {
            return Ok(());
        }
        let started = match self.started_at {
            Some(t) => t,
            None => return Ok(()),
        };
        let now = Instant::now();
        let zero = Duration::from_secs(0);
        let mut expired: Option<(Instant, bool)> = None;
        if self.timeout > zero {
            let deadline = started + self.timeout;
            if now >= deadline {
                expired = Some((deadline, false));
            }
        }
        if self.idle_timeout > zero {
            let deadline = self.output.last_output() + self.idle_timeout;
            if now >= deadline {
                expired = match expired {
                    Some((d, idle)) if d <= deadline => Some((d, idle)),
                    _ => Some((deadline, true)),
                };
            }
        }
        if let Some((_, idle)) = expired {
            tracing::warn!(idle, "timeout exceeded, killing the child");
            let _ = self.kill(zero, None);
            return Err(if idle {
                Error::IdleTimeout {
                    limit: self.idle_timeout,
                }
            } else {
                Error::Timeout {
                    limit: self.timeout,
                }
            });
        }
        Ok(())
    }

    /// Terminates the child: SIGTERM, a grace window, then the given
    /// signal (SIGKILL by default), then the sideband pid, and as a
    /// last resort a forced close. Returns the exit code.
    pub fn kill(&mut self, grace: Duration, signal: Option<i32>) -> Result<i32> {
        match self.state {
            State::Ready => return Err(Error::logic("no process has been started")),
            State::Terminated => return Ok(self.status.exit_code),
            State::Started | State::Waiting => {}
        }
        if self.status.running && self.child.is_some() {
            let _ = self.signal(TERM_SIGNAL);
            self.poll_exit(grace)?;
            if self.status.running {
                let _ = self.signal(signal.unwrap_or(KILL_SIGNAL));
                self.poll_exit(ESCALATE_WAIT)?;
            }
            if self.status.running {
                if let Some(pid) = self.fallback.pid {
                    // the wrapping shell layer may be what survived;
                    // hit the published pid directly
                    let _ = signal_pid(pid, signal.unwrap_or(KILL_SIGNAL));
                    self.poll_exit(ESCALATE_WAIT)?;
                }
            }
        }
        if self.status.running {
            tracing::warn!(pid = ?self.child_pid, "child survived kill, force-closing");
            self.status.running = false;
        }
        self.merge_fallback();
        self.finalize()?;
        Ok(self.status.exit_code)
    }

    fn poll_exit(&mut self, window: Duration) -> Result<()> {
        let deadline = Instant::now() + window;
        loop {
            self.refresh_raw_status()?;
            if !self.status.running || Instant::now() >= deadline {
                return Ok(());
            }
            thread::sleep(BUSY_WAIT);
        }
    }

    /// Delivers signal `sig` to the child and seeds the fallback
    /// record so later status queries report a consistent termination
    /// cause. On Windows any signal is a forced taskkill.
    pub fn signal(&mut self, sig: i32) -> Result<()> {
        if !matches!(self.state, State::Started | State::Waiting) || !self.status.running {
            return Err(Error::logic("no running process to signal"));
        }
        let pid = match &self.child {
            Some(child) => {
                // under the fallback wrapping the primitive pid is the
                // wrapping shell; the sideband published the real child
                match self.fallback.pid {
                    Some(inner) => signal_pid(inner, sig)?,
                    None => child.signal(sig)?,
                }
                child.pid()
            }
            None => return Err(Error::logic("no running process to signal")),
        };
        self.latest_signal = Some(sig);
        self.fallback.signaled = true;
        self.fallback.term_signal = sig;
        if self.fallback.exit_code.is_none() {
            self.fallback.exit_code = Some(-1);
        }
        tracing::debug!(signal = sig, pid, "signal sent");
        Ok(())
    }

    // -- results ------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Started | State::Waiting) && self.status.running
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// The merged status record as currently known.
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        if self.state == State::Terminated {
            Some(self.status.exit_code)
        } else {
            None
        }
    }

    pub fn is_successful(&self) -> bool {
        self.state == State::Terminated && self.status.exit_code == 0
    }

    pub fn is_signaled(&self) -> bool {
        self.status.signaled
    }

    /// The signal that terminated the child. An error when the child
    /// was signaled but the signal number could not be observed.
    pub fn term_signal(&self) -> Result<Option<i32>> {
        if !self.status.signaled {
            return Ok(None);
        }
        if self.status.term_signal < 0 {
            return Err(Error::runtime("terminating signal is unknown"));
        }
        Ok(Some(self.status.term_signal))
    }

    pub fn latest_signal(&self) -> Option<i32> {
        self.latest_signal
    }

    pub fn output(&mut self, channel: Channel) -> Result<Vec<u8>> {
        self.output.get(channel)
    }

    pub fn output_string(&mut self, channel: Channel) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.output.get(channel)?).into_owned())
    }

    /// A rewound sequential reader over one channel's collected bytes.
    pub fn output_reader(&mut self, channel: Channel) -> Result<OutputReader<'_>> {
        self.output.reader(channel)
    }

    pub fn clear_output(&mut self, channel: Channel) -> Result<()> {
        self.output.clear(channel)
    }

    // -- iteration facade ---------------------------------------------

    /// Iterates the child's output as `(channel, chunk)` pairs with
    /// the currently installed flags. Restarts reading from the top of
    /// the buffers; the child itself is not restarted.
    pub fn chunks(&mut self) -> Chunks<'_> {
        self.rewind();
        Chunks {
            sup: self,
            restore: false,
            done: false,
        }
    }

    /// Like [`chunks`](Self::chunks) with temporary flags, restored
    /// when the adapter drops.
    pub fn chunks_with(&mut self, flags: IterFlags) -> Chunks<'_> {
        self.rewind();
        self.set_iter_flags(flags);
        Chunks {
            sup: self,
            restore: true,
            done: false,
        }
    }

    /// Resets the iteration caches and both read offsets, so history
    /// is re-read from the start.
    pub fn rewind(&mut self) {
        self.iter.cache.clear();
        self.output.rewind_cursors();
    }

    /// Installs iteration flags, saving the previous set.
    pub fn set_iter_flags(&mut self, flags: IterFlags) {
        self.iter.saved.push(self.iter.flags);
        self.iter.flags = flags;
    }

    /// Restores the flags saved by the matching
    /// [`set_iter_flags`](Self::set_iter_flags).
    pub fn restore_iter_flags(&mut self) {
        if let Some(flags) = self.iter.saved.pop() {
            self.iter.flags = flags;
        }
    }

    pub fn iter_flags(&self) -> IterFlags {
        self.iter.flags
    }

    pub(crate) fn iter_valid(&mut self) -> Result<bool> {
        loop {
            if !self.iter.cache.is_empty() {
                return Ok(true);
            }
            if self.state == State::Ready {
                self.start()?;
            }
            self.update_status(false)?;
            let flags = self.iter.flags;
            let channels = [
                (Channel::Out, flags.skip_out),
                (Channel::Err, flags.skip_err),
            ];
            for &(channel, skip) in &channels {
                if !skip {
                    let data = self.output.read_at_cursor(channel)?;
                    if !data.is_empty() {
                        self.iter.cache.push_back((channel, data));
                    }
                }
            }
            if self.state == State::Terminated {
                return Ok(!self.iter.cache.is_empty());
            }
            if !self.iter.cache.is_empty() {
                return Ok(true);
            }
            if flags.non_blocking {
                // synthetic empty chunk: "no data yet"
                self.iter.cache.push_back((Channel::Out, Vec::new()));
                return Ok(true);
            }
            self.check_timeout()?;
            self.update_status(true)?;
        }
    }

    pub(crate) fn iter_take(&mut self) -> Option<(Channel, Vec<u8>)> {
        self.iter.cache.pop_front()
    }
}

impl Clone for Supervisor {
    /// An independent `Ready` instance with the same configuration.
    /// The input source handle is shared; pipes, buffers and the child
    /// handle are not.
    fn clone(&self) -> Self {
        Supervisor {
            spec: self.spec.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            timeout: self.timeout,
            idle_timeout: self.idle_timeout,
            mode: self.mode,
            options: self.options.clone(),
            input: self.input.clone(),
            pump: InputPump::new(self.input.clone()),
            state: State::Ready,
            pipes: PlatformPipes::new(),
            output: OutputBuffer::new(self.mode == Mode::OutputDisabled),
            child: None,
            child_pid: None,
            status: Status::default(),
            fallback: FallbackRecord::default(),
            latest_signal: None,
            started_at: None,
            iter: IterState::new(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.kill(Duration::from_secs(0), None);
        }
        self.pipes.close();
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("pid", &self.child_pid)
            .field("exit_code", &self.status.exit_code)
            .finish()
    }
}

fn install_env(
    config: &[(OsString, Option<OsString>)],
    extra: &[(OsString, OsString)],
) -> Vec<(OsString, Option<OsString>)> {
    let mut saved = Vec::with_capacity(config.len() + extra.len());
    for (key, value) in config {
        saved.push((key.clone(), std::env::var_os(key)));
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
    for (key, value) in extra {
        saved.push((key.clone(), std::env::var_os(key)));
        std::env::set_var(key, value);
    }
    saved
}

fn restore_env(saved: Vec<(OsString, Option<OsString>)>) {
    for (key, previous) in saved.into_iter().rev() {
        match previous {
            Some(v) => std::env::set_var(&key, v),
            None => std::env::remove_var(&key),
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: i32, sig: i32) -> Result<()> {
    crate::posix::send_signal(crate::posix::raw_pid(pid), sig)
}

#[cfg(windows)]
fn signal_pid(_pid: i32, _sig: i32) -> Result<()> {
    Ok(())
}
