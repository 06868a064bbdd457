use std::io;

use shot_guard::GuardError;

/// A frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes is shorter than its header")]
    Truncated(usize),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("unknown frame status {0}")]
    UnknownStatus(i8),

    #[error("unknown token status {0}")]
    UnknownTokenStatus(i8),

    #[error("unknown parameter tag {0}")]
    UnknownParamTag(u8),

    #[error("parameter is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after the payload")]
    TrailingBytes(usize),

    #[error("{0} does not fit in a frame")]
    TooLong(&'static str),
}

/// Errors running the token client or server.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    /// The server's lease timer needs a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,
}
