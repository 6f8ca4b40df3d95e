//! Component error types and their projection onto the shared
//! [`fleet_utils::ErrorKind`] taxonomy (spec §7).

use fleet_utils::{Classify, ErrorKind};
use thiserror::Error;

/// Failures from the SSH or HTTPS transport layer (§4.A).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("ssh dial failed: {0}")]
    SshDial(String),
    #[error("ssh session failed: {0}")]
    SshSession(String),
    #[error("address verification failed for {host}: expected one of {expected:?}, got {actual}")]
    AddressMismatch {
        host: String,
        expected: Vec<String>,
        actual: String,
    },
    #[error("no ssh authentication method available")]
    NoAuthMethod,
    #[error("https request failed: {0}")]
    Https(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Auth(_) => ErrorKind::Auth,
            TransportError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Transport,
        }
    }
}

/// Failures raised by a provider adapter operation (§4.C).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("remote object not found")]
    NotFound,
    #[error("remote object already in requested state")]
    AlreadyInState,
    #[error("execution rule forbids this transport: {0}")]
    RuleForbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Classify for AdapterError {
    fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Transport(t) => t.kind(),
            AdapterError::NotFound => ErrorKind::NotFound,
            AdapterError::AlreadyInState => ErrorKind::AlreadyInState,
            AdapterError::RuleForbidden(_) => ErrorKind::RuleForbidden,
            AdapterError::Validation(_) => ErrorKind::Validation,
            AdapterError::Timeout => ErrorKind::Timeout,
            AdapterError::Cancelled => ErrorKind::Cancelled,
            AdapterError::Storage(_) | AdapterError::Internal(_) => ErrorKind::Transport,
        }
    }
}

/// Failures from the persistence layer. Narrow and storage-agnostic so both
/// the diesel-backed and in-memory implementations can return it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound => ErrorKind::NotFound,
            StorageError::Conflict(_) => ErrorKind::Validation,
            StorageError::Backend(_) => ErrorKind::Transport,
        }
    }
}

impl From<StorageError> for AdapterError {
    fn from(e: StorageError) -> Self {
        AdapterError::Storage(e.to_string())
    }
}
