//! Storage layer for torrent data.
//!
//! Memory-bounded write-back cache of pieces over the torrent's backing
//! files, with hash verification on every write.

pub mod capacity;
pub mod file_cache;
pub mod piece_store;
#[cfg(test)]
pub mod test_fixtures;

pub use capacity::{UNBOUNDED_CAPACITY, calculate_capacity, piece_capacity};
pub use file_cache::FileHandleCache;
pub use piece_store::PieceStore;

use crate::torrent::PieceIndex;

/// Errors that occur during storage operations.
///
/// `InvalidPiece` and `OutOfBounds` reject a single bad commit. `Io` and
/// `InsufficientMemory` mean the store can no longer be trusted and end the run.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Piece index beyond the torrent's piece count
    #[error("Piece index {index} out of bounds")]
    InvalidPiece {
        /// Offending index
        index: PieceIndex,
    },

    /// Write would fall outside the piece
    #[error("Write of {length} bytes at offset {offset} outside piece {index}")]
    OutOfBounds {
        index: PieceIndex,
        offset: u64,
        length: usize,
    },

    /// Memory budget cannot hold a single piece
    #[error("Not enough memory for a single piece: {available} bytes available, piece size {piece_size}")]
    InsufficientMemory {
        /// Bytes left in the budget after current usage
        available: u64,
        piece_size: u32,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true if the error only concerns the rejected write.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidPiece { .. } | StorageError::OutOfBounds { .. }
        )
    }
}
