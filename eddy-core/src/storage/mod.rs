//! Storage layer for torrent data.
//!
//! Per-torrent piece store: completion arena, on-disk file layout and the
//! read accessor streaming and remux go through.

pub mod piece_store;

pub use piece_store::{PieceStatus, PieceStore};

use crate::torrent::{InfoHash, PieceIndex};

/// Errors that occur during storage operations.
///
/// Covers file system errors, reads of incomplete data and writes after the
/// owning session closed.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Piece {index} is not complete")]
    PieceNotReady { index: PieceIndex },

    #[error("Piece {index} does not exist")]
    PieceOutOfRange { index: PieceIndex },

    #[error("Piece {index} has {actual} bytes, expected {expected}")]
    PieceSizeMismatch {
        index: PieceIndex,
        expected: u32,
        actual: usize,
    },

    #[error("Byte range {offset}+{length} is outside file {file_index}")]
    InvalidRange {
        file_index: usize,
        offset: u64,
        length: u64,
    },

    #[error("File {file_index} does not exist")]
    FileNotFound { file_index: usize },

    #[error("Store for {info_hash} is closed")]
    Closed { info_hash: InfoHash },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
