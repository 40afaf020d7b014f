//! Custom error types for the stage controller.
//!
//! Errors come in three tiers, and callers are expected to treat them differently:
//!
//! - **`TransportError`**: the serial link itself misbehaved (I/O failure, read
//!   timeout, empty or unparseable line). The engine retries these up to its
//!   retry budget; once the budget is spent the motion state becomes `Faulted`
//!   and the link must be re-opened.
//! - **`StageError::Protocol`**: the controller answered `E<code>`. The code is
//!   mapped through [`ErrorKind`](crate::protocol::ErrorKind). These indicate a
//!   logical or parameter fault and are never retried.
//! - **`StageError::Validation`**: a client-side range or shape check failed
//!   before any byte was written.
//!
//! By using `#[from]`, `StageError` can be created from the lower-level error
//! types, so the `?` operator works across the whole crate.

use crate::protocol::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Failures of the serial link (or any line-oriented transport).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response to '{command}' within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Empty response line")]
    EmptyResponse,

    #[error("Malformed response: {raw:?}")]
    Malformed { raw: String },

    #[error("Transport closed by peer")]
    Closed,

    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// Primary error type for every engine, planner and scan operation.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Controller rejected '{command}': {kind} (E{code})", code = .kind.code())]
    Protocol { command: String, kind: ErrorKind },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stage is faulted; re-open the transport to continue")]
    Faulted,

    #[error("Wait for '{command}' was preempted by an emergency stop")]
    Preempted { command: String },

    #[error("Unexpected response to '{command}': {response}")]
    UnexpectedResponse { command: String, response: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tile handler failed at tile {index}: {message}")]
    Handler { index: usize, message: String },
}

impl StageError {
    /// True when the error requires reconnecting before anything else can run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Transport(_) | StageError::Faulted)
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        StageError::Validation(message.into())
    }
}
