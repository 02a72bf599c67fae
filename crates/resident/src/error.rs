use std::{fmt, io, time::Duration};

use crate::rewrite::RewriteError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Protocol-level errors returned by sessions.
///
/// Faults raised by user code inside the interpreter are *not* represented
/// here: the guarded block reports them as captured output and the session
/// stays usable. Everything below is a failure of the protocol itself, so
/// callers can pattern-match on the category without string parsing.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// The submitted code could not be parsed. Nothing was sent to the interpreter.
    Syntax {
        /// Parser message.
        message: String,
        /// Byte offset of the offending token in the submitted code.
        offset: u32,
    },
    /// The child process exited before the marker was observed.
    ///
    /// The session is `Closed` afterwards; a new session must be opened.
    Terminated {
        /// Output collected before the stream closed.
        partial: String,
        /// Exit code, when the process could be reaped and exited normally.
        status: Option<i32>,
    },
    /// The marker was not observed within the allotted duration.
    ///
    /// The interpreter may still be working. The submission stays outstanding
    /// and the process is left running.
    Timeout {
        /// Output collected so far.
        partial: String,
        /// How long this call waited.
        waited: Duration,
    },
    /// A save/load operation was requested without a configured template.
    Unsupported(String),
    /// The operation is not valid in the session's current state (closed,
    /// not started, or another submission outstanding).
    InvalidState(String),
    /// An argument was rejected before anything was submitted.
    InvalidArgument(String),
    /// The session configuration failed validation.
    InvalidConfig(String),
    /// The interpreter process could not be launched.
    Spawn(String),
    /// Reading from or writing to the child's pipes failed.
    Io(String),
}

impl SessionError {
    /// Returns the output collected before the failure, if any.
    #[must_use]
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::Terminated { partial, .. } | Self::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Returns true for `Timeout`.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for `Terminated`.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { message, offset } => write!(f, "syntax error at offset {offset}: {message}"),
            Self::Terminated { status: Some(code), .. } => {
                write!(f, "interpreter terminated with exit code {code}")
            }
            Self::Terminated { status: None, .. } => write!(f, "interpreter terminated"),
            Self::Timeout { waited, .. } => write!(f, "no output marker after {}ms", waited.as_millis()),
            Self::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Spawn(msg) => write!(f, "failed to launch interpreter: {msg}"),
            Self::Io(msg) => write!(f, "pipe error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RewriteError> for SessionError {
    fn from(error: RewriteError) -> Self {
        match error {
            RewriteError::Syntax { message, offset } => Self::Syntax { message, offset },
            RewriteError::Template(msg) => Self::InvalidArgument(format!("cannot guard submitted code: {msg}")),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidConfig(error.to_string())
    }
}
