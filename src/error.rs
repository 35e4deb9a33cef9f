use std::io;

use crate::buffer::BufferError;
use crate::request::ParseError;
use crate::sqlpool::PoolError;

/// Central error type for the breakwater engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Buffer index violation.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// SQL handle pool misuse or exhaustion.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Database driver error.
    #[error("sql error: {0}")]
    Sql(#[from] postgres::Error),

    /// Password hashing or verification failure.
    #[error("auth error: {0}")]
    Auth(String),

    /// Rejected configuration.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
