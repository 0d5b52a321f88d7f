use std::io;

use thiserror::Error;

/// Central error type for the etude engine.
///
/// Per-connection protocol and resource failures are not errors at this
/// level; they turn into HTTP responses and at worst close one socket.
/// `EngineError` covers the conditions the server itself has to react to.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configured listen address did not parse.
    #[error("invalid listen address: {0}")]
    InvalidAddr(String),

    /// The connection table reached its configured capacity.
    #[error("connection table is full")]
    TableFull,

    /// The work queue reached its configured capacity.
    #[error("work queue is full")]
    QueueFull,

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
