//! Error types for MUX-CORE.
//!
//! Every public operation returns a discriminated [`Error`]. Expected failure
//! modes never panic.

use thiserror::Error;

/// Errors shared by the core and every driver backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Backend I/O failure: {0}")]
    Io(String),

    #[error("Out of memory")]
    Oom,

    #[error("Buffer too small: {required} elements required")]
    BufTooSmall { required: usize },

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Returns true if the caller can recover by regrowing a buffer.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufTooSmall { .. })
    }

    /// Returns true if this error reports API misuse rather than a backend fault.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::NotSupported(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::Oom
    }
}

pub type Result<T> = std::result::Result<T, Error>;
