//! Error types for k2filter.

use thiserror::Error;

/// Error type for k2filter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid compiled index magic bytes
    #[error("invalid magic bytes: expected K2FLTR header")]
    InvalidMagic,

    /// Unsupported compiled index format version
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Compiled index was built from a different set of rule sources
    #[error("checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Invalid header size
    #[error("invalid header size: expected {expected}, got {actual}")]
    InvalidHeaderSize { expected: usize, actual: usize },

    /// Compiled index bytes failed the integrity check
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Download error
    #[error("download error: {0}")]
    Download(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for k2filter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Validation failures returned by source and exception mutations.
///
/// These are checked before any state is touched, so a call that returns one
/// of them has not changed anything.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    /// A source with the same id is already tracked
    #[error("rule source already exists")]
    AlreadyExists,

    /// No source with that id in the group
    #[error("rule source not found")]
    NotFound,

    /// File sources must be absolute paths without parent traversal
    #[error("invalid rule source path")]
    InvalidPath,

    /// URL sources must be http or https
    #[error("invalid rule source URL")]
    InvalidUrl,
}
