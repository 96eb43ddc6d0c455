//! Error types for the tile serving engine.

use thiserror::Error;

/// Errors that can occur opening a slide or servicing a tile request.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format version: {0}")]
    FormatVersion(String),

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("failed to decode JPEG: {0}")]
    DecodeError(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
