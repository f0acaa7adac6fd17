//! Streaming of torrent files while they download.
//!
//! Range requests are served by a [`FileStreamReader`] that only ever reads
//! verified pieces. [`evaluate_readiness`] backs the HEAD readiness check that tells
//! players whether to keep buffering or give up, and the remux pipeline
//! repackages containers browsers cannot play directly.

pub mod range;
pub mod readiness;
pub mod reader;
pub mod remux;

use std::time::Duration;

pub use range::{ByteRange, parse_range_header};
pub use readiness::{Readiness, evaluate_readiness};
pub use reader::FileStreamReader;
pub use remux::{
    ContainerFormat, FfmpegProcessor, ProductionFfmpeg, RemuxError, RemuxPipeline, RemuxStatus,
    detect_container_format,
};

use crate::torrent::{PieceIndex, TorrentError, TorrentHandle};

/// Errors surfaced while serving a stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Range {header:?} not satisfiable for a file of {file_length} bytes")]
    RangeNotSatisfiable { header: String, file_length: u64 },

    #[error("Piece {index} did not arrive within {waited:?}")]
    WaitTimeout { index: PieceIndex, waited: Duration },

    #[error(transparent)]
    Torrent(#[from] TorrentError),
}

/// Marks a read of a file that starts at `byte_offset`.
///
/// Raises the head and tail pieces so the player can read the container
/// headers, and moves the playback window to `byte_offset`. Reads starting
/// in the tail pieces are index lookups, not playback, and leave the window
/// where it is.
///
/// # Errors
/// - `TorrentError::FileNotFound` - Unknown file index
pub fn begin_stream(
    handle: &TorrentHandle,
    file_index: usize,
    byte_offset: u64,
) -> Result<(), TorrentError> {
    let scheduler = handle.scheduler();
    scheduler.ensure_critical(file_index)?;
    if scheduler.in_tail(file_index, byte_offset)? {
        return Ok(());
    }
    scheduler.on_playback_position(file_index, byte_offset)
}

/// Keeps the pieces of a buffering range `Critical` in the background.
///
/// The escalation ends once every piece is verified, the session closes or
/// `hold` elapses. Overlapping calls stack like concurrent reads.
///
/// # Errors
/// - `TorrentError::FileNotFound` - Unknown file index
pub fn hold_escalation(
    handle: &TorrentHandle,
    file_index: usize,
    byte_offset: u64,
    length: u64,
    hold: Duration,
) -> Result<(), TorrentError> {
    let guard = handle.scheduler().escalate(file_index, byte_offset, length)?;
    let handle = handle.clone();
    tokio::spawn(async move {
        let arrival = async {
            for piece in guard.pieces() {
                if handle.wait_for_piece(PieceIndex::new(piece)).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(hold, arrival).await.is_err() {
            tracing::debug!(
                info_hash = %handle.info_hash(),
                file_index,
                byte_offset,
                "Escalation expired before the range arrived"
            );
        }
        drop(guard);
    });
    Ok(())
}
