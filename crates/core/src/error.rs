//! Errors raised while constructing identity primitives.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic construction failures (bad input, unparsable ids).
///
/// Provider, directory and storage failures have their own types upstream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("rejected value: {0}")]
    Validation(String),

    #[error("malformed identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
