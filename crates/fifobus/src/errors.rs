use std::io;
use thiserror::Error;

/// Errors surfaced by every public entry point in this crate.
///
/// Each variant maps to a stable negative integer via [`PipeError::code`] so
/// that non-Rust peers (and log scrapers) see the same contract regardless of
/// which side of the pipe they live on.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("pipe error: {0}")]
    Other(String),

    #[error("server not available")]
    ServerNotAvailable,

    #[error("reached maximum client name index")]
    ReachedMaxNameIndex,

    #[error("file IO error: {0}")]
    FileIo(#[from] io::Error),

    #[error("timed out waiting for pipe")]
    Timeout,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("not connected to a server")]
    NotConnected,

    #[error("server has no control pipe")]
    CtrlNotAvailable,

    #[error("endpoint info file not available")]
    InfoNotAvailable,

    #[error("channel index out of bounds")]
    ChannelOob,
}

impl PipeError {
    /// The stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            PipeError::Other(_) => -1,
            PipeError::ServerNotAvailable => -2,
            PipeError::ReachedMaxNameIndex => -3,
            PipeError::FileIo(_) => -4,
            PipeError::Timeout => -5,
            PipeError::InvalidArg(_) => -6,
            PipeError::NotConnected => -7,
            PipeError::CtrlNotAvailable => -8,
            PipeError::InfoNotAvailable => -9,
            PipeError::ChannelOob => -10,
        }
    }

    pub(crate) fn other(msg: impl Into<String>) -> Self {
        PipeError::Other(msg.into())
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        PipeError::InvalidArg(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;
