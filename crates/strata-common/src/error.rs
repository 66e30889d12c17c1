//! Error types for StrataDB.

use crate::chunk::ChunkKey;
use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in StrataDB buffer operations.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("chunk already exists: {0}")]
    ChunkExists(ChunkKey),

    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkKey),

    #[error("chunk unavailable from parent tier: {0}")]
    ChunkUnavailable(ChunkKey),

    #[error("requested {requested_pages} pages but a slab holds at most {max_pages}")]
    AllocationTooLarge {
        requested_pages: usize,
        max_pages: usize,
    },

    #[error("could not evict chunks to free {requested_pages} pages")]
    OutOfMemory { requested_pages: usize },

    #[error("chunk inconsistency: {0}")]
    Inconsistency(String),

    #[error("buffer was not produced by this manager")]
    WrongBufferKind,

    #[error("{0} is not supported by this tier")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_errors_display() {
        let err = StrataError::ChunkExists(ChunkKey::new(vec![1, 2]));
        assert_eq!(err.to_string(), "chunk already exists: [1,2]");

        let err = StrataError::ChunkNotFound(ChunkKey::new(vec![3]));
        assert_eq!(err.to_string(), "chunk not found: [3]");

        let err = StrataError::ChunkUnavailable(ChunkKey::new(vec![4, 5]));
        assert_eq!(err.to_string(), "chunk unavailable from parent tier: [4,5]");
    }

    #[test]
    fn test_allocation_errors_display() {
        let err = StrataError::AllocationTooLarge {
            requested_pages: 9,
            max_pages: 4,
        };
        assert_eq!(
            err.to_string(),
            "requested 9 pages but a slab holds at most 4"
        );

        let err = StrataError::OutOfMemory { requested_pages: 3 };
        assert_eq!(err.to_string(), "could not evict chunks to free 3 pages");
    }

    #[test]
    fn test_misc_errors_display() {
        let err = StrataError::Inconsistency("target chunk is already dirty".to_string());
        assert_eq!(
            err.to_string(),
            "chunk inconsistency: target chunk is already dirty"
        );

        let err = StrataError::WrongBufferKind;
        assert_eq!(err.to_string(), "buffer was not produced by this manager");

        let err = StrataError::Unsupported("chunk metadata enumeration");
        assert_eq!(
            err.to_string(),
            "chunk metadata enumeration is not supported by this tier"
        );

        let err = StrataError::Config("page_size must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: page_size must be positive"
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StrataError>();
    }
}
