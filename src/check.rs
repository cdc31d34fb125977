//! Platform capability oracle. Every probe runs once, at first use,
//! and the answer is cached for the life of the process.

use once_cell::sync::Lazy;

/// True when the host uses Windows path conventions.
pub fn is_windows() -> bool {
    std::path::MAIN_SEPARATOR == '\\'
}

/// Whether a child can be bound to the controlling terminal, probed
/// with a throwaway `sh -c ':'` spawn against `/dev/tty`.
#[cfg(unix)]
pub fn supports_tty() -> bool {
    static PROBE: Lazy<bool> = Lazy::new(crate::posix::probe_tty);
    *PROBE
}

#[cfg(windows)]
pub fn supports_tty() -> bool {
    false
}

/// Whether a pseudo-terminal pair can host a child.
#[cfg(unix)]
pub fn supports_pty() -> bool {
    static PROBE: Lazy<bool> = Lazy::new(crate::posix::probe_pty);
    *PROBE
}

#[cfg(windows)]
pub fn supports_pty() -> bool {
    false
}

/// Whether the runtime hides child signal termination, forcing exit
/// status to travel over the fd-3 sideband. No native Rust target does
/// this, so the flag is driven by `OVERSEER_CONSTRAINED_CHILD`, which
/// also keeps the fallback path testable everywhere.
pub fn constrained_child() -> bool {
    static FLAG: Lazy<bool> = Lazy::new(|| {
        matches!(
            std::env::var("OVERSEER_CONSTRAINED_CHILD").ok().as_deref(),
            Some("1") | Some("true") | Some("yes")
        )
    });
    *FLAG
}

/// Records capability problems found by [`check`].
#[derive(Debug, Default)]
pub struct CheckResult {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl CheckResult {
    pub fn new() -> CheckResult {
        Default::default()
    }

    /// Records a problem that makes spawning impossible.
    pub(crate) fn error(&mut self, message: &str) {
        self.errors.push(message.to_string())
    }

    pub(crate) fn warning(&mut self, message: &str) {
        self.warnings.push(message.to_string())
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl std::fmt::Display for CheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() && self.warnings.is_empty() {
            return "OK".fmt(f);
        }
        if !self.errors.is_empty() {
            "Errors:\n".fmt(f)?;
            for err in &self.errors {
                writeln!(f, "\t{}", err)?;
            }
        }
        if !self.warnings.is_empty() {
            "Warnings:\n".fmt(f)?;
            for warn in &self.warnings {
                writeln!(f, "\t{}", warn)?;
            }
        }
        Ok(())
    }
}

/// Reports host configuration problems: a missing spawn shell (fatal),
/// modes that will be rejected, and runtime quirks that change how
/// exit status is collected.
pub fn check(res: &mut CheckResult) {
    if is_windows() {
        if std::env::var_os("ComSpec").is_none() {
            res.error("ComSpec is not set: the cmd interpreter cannot be located");
        }
    } else {
        if !std::path::Path::new("/bin/sh").exists() {
            res.error("no shell at /bin/sh: children cannot be spawned");
        }
        if !supports_tty() {
            res.warning("no usable /dev/tty: tty mode will be rejected");
        }
        if !supports_pty() {
            res.warning("pseudo-terminal devices unavailable: pty mode will be rejected");
        }
    }
    if constrained_child() {
        res.warning(
            "child signal reporting is constrained: exit status arrives on the fd-3 sideband",
        );
    }
}
