//! Error types for the bisection core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while driving a bisection run.
#[derive(Debug, Error)]
pub enum BisectError {
    /// The handler could not produce a midpoint or resolve its build range.
    #[error("search failed: {0}")]
    Search(String),

    #[error("invalid build range: {0}")]
    InvalidRange(String),

    /// The focused download failed while its step was waiting on it.
    #[error("download of {} failed: {reason}", dest.display())]
    Download { dest: PathBuf, reason: String },

    #[error("download of {} was cancelled while its step was active", dest.display())]
    DownloadCancelled { dest: PathBuf },

    #[error("failed to launch build {key}: {reason}")]
    Launch { key: String, reason: String },

    /// A call made out of order; always a bug in the caller.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    #[error("worker context failure: {0}")]
    Worker(String),
}

/// Convenience result alias.
pub type BisectResult<T> = std::result::Result<T, BisectError>;
