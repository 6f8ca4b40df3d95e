//! The error-kind taxonomy from spec §7, shared by every component so the
//! task engine and health checker can react uniformly without downcasting
//! concrete error types.
//!
//! Mirrors the teacher's `ReportableError`/`ErrorKind` split in
//! `proxy::control_plane::provider::errors`: each component defines its own
//! `thiserror` enum, then implements [`Classify`] to project it onto this
//! shared, small set of buckets.

use std::fmt;

/// The error kinds distinguished by the core, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SSH dial/session or HTTPS call failure.
    Transport,
    /// 401/403 or unparsable credential material.
    Auth,
    /// Remote object does not exist.
    NotFound,
    /// Remote object already in the requested state.
    AlreadyInState,
    /// The provider's execution rule forbids the transport this op needs.
    RuleForbidden,
    /// Bad input (name, memory format, ...) caught before dispatch.
    Validation,
    /// Exceeded `timeout_seconds`.
    Timeout,
    /// Global shutdown or force-stop.
    Cancelled,
    /// Three-tier limiter forbids the operation.
    Quota,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyInState => "already-in-state",
            ErrorKind::RuleForbidden => "rule-forbidden",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Quota => "quota",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Whether a task that failed with this kind should be treated as a
    /// successful no-op rather than a failure (spec §7, "local recovery").
    pub fn is_benign(&self) -> bool {
        matches!(self, ErrorKind::NotFound | ErrorKind::AlreadyInState)
    }
}

/// Implemented by every component's leaf error type so callers can classify
/// without matching on concrete variants.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
