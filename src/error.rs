use thiserror::Error;

use crate::ha::endpoint::Role;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ERR connection error: {0}")]
    Connection(String),

    #[error("ERR operation timed out")]
    Timeout,

    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Error reply sent by the server (`-ERR ...`)
    #[error("{0}")]
    Server(String),

    #[error("ERR invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// No master, slave or sentinel could be discovered at all
    #[error("FATAL cannot discover topology: {0}")]
    NoTopology(String),

    /// A group exists but none of its nodes is usable
    #[error("FATAL no usable {role} node available")]
    NoNodeAvailable { role: Role },

    #[error("ERR seed type mismatch: expected {expected}, got {actual}")]
    SeedMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("ERR {0} is disposed")]
    Disposed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors mean the manager has no route for the request at all,
    /// as opposed to an ordinary command or connection failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoTopology(_) | Error::NoNodeAvailable { .. })
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

pub type Result<T> = std::result::Result<T, Error>;
