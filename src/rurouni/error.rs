//! Error types for the write cache, writer loop, and config/schema loading.

use std::path::PathBuf;
use thiserror::Error;

use crate::kenshin::error::KenshinError;

#[derive(Debug, Error)]
pub enum RurouniError {
    #[error(transparent)]
    Kenshin(#[from] KenshinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("too many malformed metric index lines (tolerance is one bad line)")]
    TooManyMalformedIndexLines,

    #[error("bundle {path} is full, cannot allocate another position")]
    FileCacheFull { path: PathBuf },

    #[error("invalid storage schema config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RurouniError>;
