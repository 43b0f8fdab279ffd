#![forbid(unsafe_code)]
//! Error types for PageVault.
//!
//! Defines `PgvError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all PageVault operations.
#[derive(Debug, Error)]
pub enum PgvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote store {op} failed: {detail}")]
    Remote { op: &'static str, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PgvError {
    /// Build a remote-store failure with the failing operation attached.
    #[must_use]
    pub fn remote(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Remote {
            op,
            detail: detail.into(),
        }
    }
}

/// Result alias using `PgvError`.
pub type Result<T> = std::result::Result<T, PgvError>;
