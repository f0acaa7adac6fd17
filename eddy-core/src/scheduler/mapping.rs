//! Byte-range to piece-range mapping and the layered priority plan.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::torrent::{FileEntry, PiecePriority, TorrentMetadata};

/// Pieces a window of `window_bytes` starting at `byte_offset` of `file` covers.
///
/// Offsets are file relative; the returned range holds global piece indices.
/// The end piece is the one containing `byte_offset + window_bytes`, clamped
/// to the file's last piece, so oversized windows never fail. Zero-length
/// files map to an empty range.
pub fn window_pieces(
    file: &FileEntry,
    piece_length: u32,
    byte_offset: u64,
    window_bytes: u64,
) -> Range<u32> {
    let (Some(first), Some(last)) = (
        file.piece_at(byte_offset, piece_length),
        file.piece_at(byte_offset.saturating_add(window_bytes), piece_length),
    ) else {
        return 0..0;
    };
    first.as_u32()..last.as_u32() + 1
}

/// Inputs that decide every piece's level.
#[derive(Debug, Default)]
pub(crate) struct PriorityPlan {
    /// Pieces of the active window and the file they belong to
    pub(crate) window: Option<(usize, Range<u32>)>,
    /// Reference counts of pieces escalated by in-flight reads
    pub(crate) escalations: HashMap<u32, usize>,
    /// Files whose head and tail pieces were raised on stream start
    pub(crate) critical_files: HashSet<usize>,
    /// Levels set explicitly by clients, keyed by piece
    pub(crate) manual: HashMap<u32, PiecePriority>,
}

impl PriorityPlan {
    /// Computes the level of every piece.
    ///
    /// Window and escalated pieces are `Critical`, head/tail pieces of
    /// started streams `High`, pieces of the window's file behind the window
    /// `Low`, everything else `Normal`. Manual levels replace the base level
    /// of their pieces; the window, escalations and head/tail raises still
    /// apply on top.
    pub(crate) fn levels(
        &self,
        metadata: &TorrentMetadata,
        head_pieces: u32,
        tail_pieces: u32,
    ) -> Vec<PiecePriority> {
        let mut levels = vec![PiecePriority::Normal; metadata.piece_count() as usize];

        if let Some((file_index, window)) = &self.window
            && let Some(file) = metadata.files.get(*file_index)
        {
            // Behind the playhead: still wanted, but last.
            for slot in file.pieces.start..window.start {
                if let Some(level) = levels.get_mut(slot as usize) {
                    *level = PiecePriority::Low;
                }
            }
        }
        for (piece, manual) in &self.manual {
            if let Some(level) = levels.get_mut(*piece as usize) {
                *level = *manual;
            }
        }

        let mut raise = |range: Range<u32>, level: PiecePriority| {
            let end = (range.end as usize).min(levels.len());
            let start = (range.start as usize).min(end);
            for slot in &mut levels[start..end] {
                *slot = (*slot).max(level);
            }
        };

        for file_index in &self.critical_files {
            let Some(file) = metadata.files.get(*file_index) else {
                continue;
            };
            let pieces = file.pieces.clone();
            let head_end = pieces.start.saturating_add(head_pieces).min(pieces.end);
            let tail_start = pieces.end.saturating_sub(tail_pieces).max(pieces.start);
            raise(pieces.start..head_end, PiecePriority::High);
            raise(tail_start..pieces.end, PiecePriority::High);
        }

        if let Some((_, window)) = &self.window {
            raise(window.clone(), PiecePriority::Critical);
        }
        for piece in self.escalations.keys() {
            raise(*piece..*piece + 1, PiecePriority::Critical);
        }
        levels
    }
}

/// Collapses per-piece differences into runs of equal target level.
pub(crate) fn diff_runs(
    applied: &[PiecePriority],
    target: &[PiecePriority],
) -> Vec<(Range<u32>, PiecePriority)> {
    let mut runs: Vec<(Range<u32>, PiecePriority)> = Vec::new();
    for (index, (old, new)) in applied.iter().zip(target).enumerate() {
        if old == new {
            continue;
        }
        let index = index as u32;
        match runs.last_mut() {
            Some((range, level)) if range.end == index && level == new => range.end += 1,
            _ => runs.push((index..index + 1, *new)),
        }
    }
    runs
}
