//! Error taxonomy shared by every component of the agent.
//!
//! Each variant maps to a recovery policy:
//! - `NotFound`, `AlreadyExists` and `Conflict` drive state transitions
//! - `Retryable` is backed off and re-enqueued
//! - `Cancelled` is swallowed at the worker boundary
//! - `InvalidArgument` and `Internal` are terminal for the affected pod
//! - `Config` is fatal at startup

use reqwest::StatusCode;
use thiserror::Error;

/// Agent errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Creation target already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request or spec.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transient network or server failure.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Operation aborted by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Fatal startup error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected failure that is not worth retrying.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Process exit codes.
pub mod exit {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const REGISTRATION: i32 = 2;
    pub const PROVIDER: i32 = 3;
}

impl Error {
    /// Map an HTTP status from the provider protocol to an error kind.
    ///
    /// 409 is `AlreadyExists` when `creating`, `Conflict` otherwise.
    pub fn from_status(status: StatusCode, message: impl Into<String>, creating: bool) -> Self {
        let message = message.into();
        match status.as_u16() {
            400 | 422 => Self::InvalidArgument(message),
            404 => Self::NotFound(message),
            409 if creating => Self::AlreadyExists(message),
            409 => Self::Conflict(message),
            408 | 429 => Self::Retryable(message),
            code if code >= 500 => Self::Retryable(message),
            _ => Self::Internal(message),
        }
    }

    /// Stable reason code for events and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Conflict(_) => "Conflict",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Retryable(_) => "Retryable",
            Self::Cancelled => "Cancelled",
            Self::Config(_) => "ConfigError",
            Self::Internal(_) => "Internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Exit code for an error that ends the process outside registration.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InvalidArgument(_) => exit::CONFIG,
            _ => exit::PROVIDER,
        }
    }

    /// Errors that must not be retried and are surfaced as events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::Internal(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Internal(format!("malformed provider response: {err}"));
        }
        if err.is_builder() {
            return Self::InvalidArgument(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status, err.to_string(), false);
        }
        Self::Retryable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}
