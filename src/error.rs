use std::io;

use thiserror::Error;

/// Errors that can occur when working with a disk multi-map
#[derive(Error, Debug)]
pub enum DiskMapError {
    /// IO errors from the backing file: open, resize, map, flush
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The key cannot be interned (interior NUL byte)
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A payload wider than the table's value width
    #[error("value too wide: table holds {width} bytes, got {got}")]
    ValueTooWide { width: u64, got: u64 },
}

pub type Result<T> = std::result::Result<T, DiskMapError>;
