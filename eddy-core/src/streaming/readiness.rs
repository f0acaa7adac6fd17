//! Readiness of a byte range for HEAD checks and GET gating.

use serde::Serialize;

use crate::torrent::{PieceIndex, TorrentError, TorrentHandle};

/// Whether a range can be served now, later, or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Readiness {
    /// Every covering piece is complete
    Ready,
    /// Pieces are missing but may still arrive
    Buffering { missing: u32 },
    /// A missing piece is held by no connected peer
    Unobtainable { piece: PieceIndex },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Classifies `length` bytes at `byte_offset` of a file.
///
/// A piece is unobtainable only once at least one peer has reported its
/// holdings and none of the connected peers has it. Before any peer reports
/// the range is `Buffering`.
///
/// # Errors
/// - `TorrentError::FileNotFound` - Unknown file index
/// - `TorrentError::SessionClosed` - The session was closed
pub fn evaluate_readiness(
    handle: &TorrentHandle,
    file_index: usize,
    byte_offset: u64,
    length: u64,
) -> Result<Readiness, TorrentError> {
    if handle.is_closed() {
        return Err(TorrentError::SessionClosed {
            info_hash: handle.info_hash(),
        });
    }
    let metadata = handle.metadata();
    let file = metadata.file(file_index)?;
    let pieces = file.pieces_for_bytes(byte_offset, length, metadata.piece_length);
    let store = handle.store();

    let missing: Vec<PieceIndex> = pieces
        .map(PieceIndex::new)
        .filter(|piece| !store.is_complete(*piece))
        .collect();
    if missing.is_empty() {
        return Ok(Readiness::Ready);
    }

    if handle.peers_reported() > 0
        && let Some(piece) = missing
            .iter()
            .find(|piece| handle.piece_availability(**piece) == 0)
    {
        return Ok(Readiness::Unobtainable { piece: *piece });
    }
    Ok(Readiness::Buffering {
        missing: missing.len() as u32,
    })
}
