use std::time::Duration;

/// Broad classification of an [`Error`], for callers that only need to
/// branch on the family of failure rather than the exact variant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// A value handed to the library was unusable (bad chunk, missing
    /// placeholder, mode not available on this platform).
    InvalidArgument,
    /// The operation is illegal for the object's current state.
    Logic,
    /// The operating system refused an operation, or the child
    /// terminated in an unexpected way.
    Runtime,
    /// The wall-clock limit was exceeded.
    Timeout,
    /// The idle limit was exceeded.
    IdleTimeout,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Logic(String),
    #[error("{0}")]
    Runtime(String),
    #[error("process ran longer than the {limit:?} limit")]
    Timeout { limit: Duration },
    #[error("process produced no output for longer than the {limit:?} limit")]
    IdleTimeout { limit: Duration },
    #[error("io error")]
    Io {
        #[from]
        cause: std::io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Logic(_) => ErrorKind::Logic,
            Error::Runtime(_) => ErrorKind::Runtime,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::IdleTimeout { .. } => ErrorKind::IdleTimeout,
            Error::Io { .. } => ErrorKind::Runtime,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::IdleTimeout
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        if let Some(errno) = err.as_errno() {
            Error::Io {
                cause: std::io::Error::from_raw_os_error(errno as i32),
            }
        } else {
            Error::Runtime(err.to_string())
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
