//! Shared error types: the two-class network error model (§7) and the
//! process-level exit-code mapping.

use std::fmt;

use thiserror::Error;

/// Fatal vs. transient classification for any HTTP call made against the
/// FHIR server. Fatal errors never retry; transient errors retry per the
/// backoff policy in [`crate::client`] and escalate to fatal once exhausted.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// 4xx other than rate-limiting, a resourceType mismatch, or an
    /// OperationOutcome with severity fatal/error.
    Fatal(String),
    /// Timeouts, 5xx, or rate-limiting (429).
    Transient(String),
}

impl ClientError {
    pub fn message(&self) -> &str {
        match self {
            ClientError::Fatal(m) | ClientError::Transient(m) => m,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Fatal(_))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Fatal(m) => write!(f, "fatal error: {m}"),
            ClientError::Transient(m) => write!(f, "transient error: {m}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Top-level error used by `main` to decide the process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad arguments, unknown types, context mismatch: exit code 2.
    #[error("{0}")]
    UserError(String),
    /// I/O or remote failure: non-zero (but not 2).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::UserError(_) => 2,
            CliError::Other(_) => 1,
        }
    }
}
