//! Error types for packing.

use thiserror::Error;

/// Packing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    #[error("invalid chunk size {0}: must be positive")]
    InvalidChunkSize(usize),

    #[error("ids/mask length mismatch: {ids} ids vs {mask} mask values")]
    LengthMismatch { ids: usize, mask: usize },
}

/// Result type for packing operations
pub type Result<T> = std::result::Result<T, PackError>;
