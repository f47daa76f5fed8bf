use thiserror::Error;

use crate::path::{Path, PathError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid email address")]
    InvalidEmail,

    #[error("password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("email address is already in use")]
    EmailInUse,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("session token is invalid or expired")]
    InvalidToken,

    #[error("not signed in")]
    NotSignedIn,

    #[error("profile write failed, sign-up rolled back: {0}")]
    ProfileWrite(WriteError),

    #[error("backend disconnected")]
    Disconnected,

    #[error("auth backend error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("permission denied writing {path}")]
    PermissionDenied { path: Path },

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("could not encode value: {0}")]
    Encode(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("backend disconnected")]
    Disconnected,

    #[error("backend write error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for WriteError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("permission denied reading {path}")]
    PermissionDenied { path: Path },

    #[error("connection to backend lost")]
    ConnectionLost,

    #[error("could not decode snapshot: {0}")]
    Decode(String),
}
