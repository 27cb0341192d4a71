//! Server error types.

use schemadrift_core::{MigrationError, SourceError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Engine error.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Sample source error.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// CSV decoding error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Output encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
