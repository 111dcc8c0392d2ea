//! Error types for Betula.

use thiserror::Error;

/// Result type alias using BetulaError.
pub type Result<T> = std::result::Result<T, BetulaError>;

/// Errors that can occur in Betula operations.
#[derive(Debug, Error)]
pub enum BetulaError {
    /// The queried key has no live value. Expected and recoverable;
    /// also used internally to signal the end of a message stream.
    #[error("key not found")]
    NotFound,

    // I/O errors from the backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of a key, value, or blob payload failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// An on-disk image disagrees with the bookkeeping that describes it.
    /// The space must not be trusted after this is returned.
    #[error("object {id} corrupted: {reason}")]
    Corruption { id: u64, reason: String },

    #[error("blob not found: {0}")]
    BlobNotFound(u64),

    // Configuration errors
    #[error("invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}

impl BetulaError {
    /// Builds a corruption error for the given object ID.
    pub fn corruption(id: u64, reason: impl Into<String>) -> Self {
        BetulaError::Corruption {
            id,
            reason: reason.into(),
        }
    }

    /// Returns true for the expected-and-recoverable not-found case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BetulaError::NotFound)
    }
}
