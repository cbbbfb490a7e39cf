//! Error types for the package crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive does not contain a manifest.json")]
    ManifestNotFound,

    #[error("manifest validation error: {0}")]
    ManifestInvalid(String),

    #[error("entry file not found in archive: {0}")]
    EntryNotFound(String),

    #[error("entry file {path} is neither UTF-8 text nor a wasm module")]
    EntryUnreadable { path: String },
}
