//! Error types for the async services and the shell's own tokenizer.
//!
//! Nothing below crosses a process boundary: built-ins match on these and
//! translate them into a stderr message plus an exit code at the call site,
//! per the propagation policy in SPEC_FULL.md §7.

use thiserror::Error;

/// Failures from the storage, timer, and HTTP services (§6.1, §6.2).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}: no such file")]
    NotFound(String),

    #[error("request aborted")]
    Aborted,

    #[error("http {0}")]
    Http(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failures from the shell's line/pipe tokenizer (§4.3).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("sh: invalid pipe")]
    InvalidPipe,

    #[error("sh: command not found: {0}")]
    CommandNotFound(String),
}
