use thiserror::Error;

/// Failures reported by the session store (identity provider).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("an account with this email already exists")]
    AlreadyRegistered,

    #[error("identity provider error: {0}")]
    Provider(String),

    #[error("identity provider did not answer in time")]
    TimedOut,
}

impl From<tradepost_core::DomainError> for AuthError {
    fn from(value: tradepost_core::DomainError) -> Self {
        Self::Provider(value.to_string())
    }
}
