//! Error types for segdl core

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in segdl core
#[derive(Debug, Error)]
pub enum SegdlError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Download not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
