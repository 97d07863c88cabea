//! Control-plane error type.
//!
//! Errors that can be returned to the API collaborator. Engine-internal
//! failures travel over the command channel as `InitFailure` replies or are
//! detected as channel closure and surface here as `EngineLost`.

use std::{error, fmt, io};

/// Convenience alias used throughout the control plane.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by session and registry operations.
#[derive(Debug)]
pub enum Error {
    /// Bad session id, unknown animator kind, or an unusable motion source.
    /// No session is created.
    InvalidInput(String),
    /// A session with this id already exists (or is being created).
    AlreadyExists(String),
    /// No session with this id.
    NotFound(String),
    /// The engine did not complete its handshake within the deadline.
    InitTimeout,
    /// The animator's `initialize` reported a failure.
    InitFailure(String),
    /// The operation was invoked on a session past `Closing`.
    ClosedSession,
    /// The engine process exited unexpectedly.
    EngineLost,
    /// An OS-level failure while operating the session.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput(what) => write!(f, "invalid input: {what}"),
            Error::AlreadyExists(id) => write!(f, "session '{id}' already exists"),
            Error::NotFound(id) => write!(f, "no session '{id}'"),
            Error::InitTimeout => write!(f, "engine handshake timed out"),
            Error::InitFailure(reason) => write!(f, "animator initialization failed: {reason}"),
            Error::ClosedSession => write!(f, "session is closed"),
            Error::EngineLost => write!(f, "engine process lost"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        // A broken pipe on the command channel means the engine went away.
        if err.kind() == io::ErrorKind::BrokenPipe {
            Error::EngineLost
        } else {
            Error::Io(err)
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Error {
        Error::from(io::Error::from(err))
    }
}
