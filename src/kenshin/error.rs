//! Error types for the bundle codec, schema registry and archive engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by schema validation, bundle creation/update/fetch, and
/// header (de)serialization.
#[derive(Debug, Error)]
pub enum KenshinError {
    /// A schema's retention list, xff, or bundle width failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// `fetch` was called with `from_time >= until_time`.
    #[error("from_time '{from}' is after until_time '{until}'")]
    InvalidTime { from: i64, until: i64 },

    /// `create` was called on a path that already has a file.
    #[error("file already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bundle file's header failed to parse (bad magic size, truncated
    /// read, inconsistent archive table).
    #[error("corrupt bundle file {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// An aggregation name outside of `avg|sum|last|max|min`.
    #[error("unknown aggregation method: {0}")]
    UnknownAgg(String),
}

pub type Result<T> = std::result::Result<T, KenshinError>;
