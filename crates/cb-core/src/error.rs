//! # AppError
//!
//! Centralized error handling for the campus-board client core.
//! Maps remote and local failures to the four kinds the viewer can act on.

use thiserror::Error;

/// The primary error type for all cb-core operations.
///
/// `Clone` because errors travel inside broadcast notifications.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Input rejected locally before any remote call (e.g. title too long, sensitive word)
    #[error("validation error: {0}")]
    ValidationFailed(String),

    /// The action needs a signed-in viewer
    #[error("sign-in required: {0}")]
    NotAuthenticated(String),

    /// The gateway call returned an error or a row we could not decode
    #[error("remote call failed: {0}")]
    RemoteFailed(String),

    /// Resource not found (e.g. Post, Comment)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// The same submission is already in flight
    #[error("conflict: {0}")]
    Conflict(String),
}

impl AppError {
    /// Wraps a port failure with the operation it interrupted.
    pub fn remote(context: &str, err: anyhow::Error) -> Self {
        AppError::RemoteFailed(format!("{context}: {err:#}"))
    }

    /// Remote failures are surfaced with a retry affordance; everything else
    /// needs the viewer to change something first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::RemoteFailed(_))
    }
}

/// A specialized Result type for campus-board logic.
pub type Result<T> = std::result::Result<T, AppError>;
