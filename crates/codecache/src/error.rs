//! Error types for the code cache.
//!
//! Nothing here is fatal to the embedding translator: every failure is
//! recovered locally by degrading the affected region (dropping a record,
//! discarding a file view, or disabling serialization for that region).

use thiserror::Error;

/// Cache loader/writer error kinds
#[derive(Debug, Error)]
pub enum CacheError {
    /// The file's format-version cookie does not match this build
    #[error("cache file cookie mismatch: expected {expected:#018x}, got {actual:#018x}")]
    CookieMismatch { expected: u64, actual: u64 },

    /// The file was produced under a different translator configuration
    #[error("cache file was built under a different translator configuration")]
    ConfigMismatch,

    /// Structural damage in the file body
    #[error("corrupt cache file: {0}")]
    Corrupt(&'static str),

    /// Unknown relocation tag in a record's relocation blob
    #[error("unknown relocation tag: {0:#04x}")]
    BadRelocationTag(u8),

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
