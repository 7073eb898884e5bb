//! Core error model.

use thiserror::Error;

/// Result type used by the core data types.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure while building or decoding a core value.
///
/// Transport and broker failures live in `eventq-broker`; this type only covers
/// deterministic problems with the values themselves.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An event payload could not be converted to or from its typed form.
    #[error("invalid payload: {0}")]
    Payload(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }
}
