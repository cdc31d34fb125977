use crate::{
    error::{Error, Result},
    input::InputSource,
    Mode, SpawnOptions, Supervisor,
};
use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    time::Duration,
};

/// The two accepted command shapes.
#[derive(Debug, Clone)]
pub(crate) enum CommandSpec {
    /// Pre-tokenized vector; every element is escaped individually.
    Argv(Vec<OsString>),
    /// A single shell string, possibly holding `"${:NAME}"`
    /// placeholders resolved against the configured environment.
    Shell(OsString),
}

/// Child process builder.
///
/// Collects the frozen configuration (command shape, working dir,
/// environment, clocks, mode, platform options, input source) and
/// turns it into a [`Supervisor`] with [`supervise`](Self::supervise).
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) spec: CommandSpec,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: Vec<(OsString, Option<OsString>)>,
    pub(crate) timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) mode: Mode,
    pub(crate) options: SpawnOptions,
    pub(crate) input: Option<InputSource>,
}

impl Command {
    /// Vector-form command starting with `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Command {
        Command {
            spec: CommandSpec::Argv(vec![program.as_ref().to_os_string()]),
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_secs(0),
            idle_timeout: Duration::from_secs(0),
            mode: Mode::Piped,
            options: SpawnOptions::default(),
            input: None,
        }
    }

    /// Shell-form command: `line` is handed to the platform shell as
    /// is, after `"${:NAME}"` placeholder substitution.
    pub fn shell(line: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new("");
        cmd.spec = CommandSpec::Shell(line.as_ref().to_os_string());
        cmd
    }

    /// Appends one argument. No effect on shell-form commands.
    pub fn arg(&mut self, a: impl AsRef<OsStr>) -> &mut Self {
        if let CommandSpec::Argv(argv) = &mut self.spec {
            argv.push(a.as_ref().to_os_string());
        }
        self
    }

    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut Self {
        for a in args {
            self.arg(a);
        }
        self
    }

    /// Sets an environment variable for the child.
    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        self.env.push((
            key.as_ref().to_os_string(),
            Some(value.as_ref().to_os_string()),
        ));
        self
    }

    pub fn envs(
        &mut self,
        vars: impl IntoIterator<Item = (impl AsRef<OsStr>, impl AsRef<OsStr>)>,
    ) -> &mut Self {
        for (k, v) in vars {
            self.env(k, v);
        }
        self
    }

    /// Removes a variable from the child's environment.
    pub fn env_remove(&mut self, key: impl AsRef<OsStr>) -> &mut Self {
        self.env.push((key.as_ref().to_os_string(), None));
        self
    }

    pub fn current_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.cwd.replace(dir.as_ref().to_path_buf());
        self
    }

    /// Wall-clock limit for the whole run. Zero disables the clock.
    pub fn timeout(&mut self, limit: Duration) -> &mut Self {
        self.timeout = limit;
        self
    }

    /// Limit on the time between two output chunks. Zero disables.
    pub fn idle_timeout(&mut self, limit: Duration) -> &mut Self {
        self.idle_timeout = limit;
        self
    }

    pub fn mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn options(&mut self, options: SpawnOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Installs the child's input. The handle may be kept by the
    /// caller and appended to while the child runs.
    pub fn input(&mut self, source: InputSource) -> &mut Self {
        self.input.replace(source);
        self
    }

    pub fn supervise(self) -> Supervisor {
        Supervisor::new(self)
    }
}

// ---------------------------------------------------------------------
// Command-string composition. Pure so both platform strategies and the
// tests share one implementation.
// ---------------------------------------------------------------------

/// POSIX escaping: single-quote wrap, embedded `'` becomes `'\''`.
pub(crate) fn posix_quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

const CMD_META: &str = "()%!^\"<>&| \t\r\n";

/// Windows escaping: Microsoft command-line quoting with trailing
/// backslashes doubled, and the cmd metacharacters `"^%!` and newline
/// re-encoded so they survive `cmd /V:ON` delayed expansion. A newline
/// becomes `!LF!`; the caller must provide the `LF` variable.
pub(crate) fn windows_quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| CMD_META.contains(c)) {
        return arg.to_string();
    }
    let trailing = arg.chars().rev().take_while(|&c| c == '\\').count();
    let mut out = String::with_capacity(arg.len() + trailing + 2);
    out.push('"');
    for c in arg.chars() {
        match c {
            '"' => out.push_str("\"\""),
            '^' => out.push_str("\"^^\""),
            '%' => out.push_str("\"^%\""),
            '!' => out.push_str("\"^!\""),
            '\n' => out.push_str("!LF!"),
            c => out.push(c),
        }
    }
    for _ in 0..trailing {
        out.push('\\');
    }
    out.push('"');
    out
}

pub(crate) fn uses_lf_variable(line: &str) -> bool {
    line.contains("!LF!")
}

/// Replaces each `"${:NAME}"` with `escape(lookup(NAME))`. A missing
/// value is an error.
pub(crate) fn substitute_placeholders(
    template: &str,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
    escape: &mut dyn FnMut(&str) -> String,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(at) = rest.find("${:") {
        out.push_str(&rest[..at]);
        let tail = &rest[at + 3..];
        let end = tail
            .find('}')
            .ok_or_else(|| Error::invalid("unterminated \"${:NAME}\" placeholder"))?;
        let name = &tail[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::invalid(format!(
                "malformed placeholder name \"{}\"",
                name
            )));
        }
        let value = lookup(name).ok_or_else(|| {
            Error::invalid(format!("no value for placeholder \"${{:{}}}\"", name))
        })?;
        out.push_str(&escape(&value));
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn argv_as_str(argv: &[OsString]) -> Result<Vec<&str>> {
    argv.iter()
        .map(|a| {
            a.to_str()
                .ok_or_else(|| Error::invalid("command arguments must be valid UTF-8"))
        })
        .collect()
}

/// Final POSIX command string: escaped argv joined and `exec`-prefixed
/// so the shell replaces itself, or the substituted shell line.
pub(crate) fn compose_posix(
    spec: &CommandSpec,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
) -> Result<String> {
    match spec {
        CommandSpec::Argv(argv) => {
            let argv = argv_as_str(argv)?;
            let mut line = String::from("exec ");
            for (i, a) in argv.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                line.push_str(&posix_quote(a));
            }
            Ok(line)
        }
        CommandSpec::Shell(line) => {
            let line = line
                .to_str()
                .ok_or_else(|| Error::invalid("shell command must be valid UTF-8"))?;
            substitute_placeholders(line, lookup, &mut |v| posix_quote(v))
        }
    }
}

/// Windows composition result: the inner command line plus the
/// delayed-expansion variables it relies on.
pub(crate) struct ComposedWindows {
    pub line: String,
    pub extra_env: Vec<(String, String)>,
}

/// Composes the inner Windows command line. Placeholder values with
/// cmd-unsafe characters are routed through `!OVERSEER_Vn!` variables
/// whose values (NUL bytes replaced by `?`) must be installed in the
/// child's environment; this preserves exact bytes through cmd's
/// quoting rules.
pub(crate) fn compose_windows(
    spec: &CommandSpec,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
) -> Result<ComposedWindows> {
    let mut extra_env: Vec<(String, String)> = Vec::new();
    let line = match spec {
        CommandSpec::Argv(argv) => {
            let argv = argv_as_str(argv)?;
            argv.iter()
                .map(|a| windows_quote(a))
                .collect::<Vec<_>>()
                .join(" ")
        }
        CommandSpec::Shell(line) => {
            let line = line
                .to_str()
                .ok_or_else(|| Error::invalid("shell command must be valid UTF-8"))?;
            let vars = &mut extra_env;
            substitute_placeholders(line, lookup, &mut |value| {
                if value.chars().any(|c| CMD_META.contains(c)) {
                    let name = format!("OVERSEER_V{}", vars.len() + 1);
                    vars.push((name.clone(), value.replace('\0', "?")));
                    format!("!{}!", name)
                } else {
                    windows_quote(value)
                }
            })?
        }
    };
    if uses_lf_variable(&line) {
        extra_env.push(("LF".to_string(), "\n".to_string()));
    }
    Ok(ComposedWindows { line, extra_env })
}
