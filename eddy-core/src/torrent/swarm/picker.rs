//! Priority-ordered piece selection shared by all peer workers of a session.

use std::ops::Range;

use crate::storage::PieceStore;
use crate::torrent::protocol::Bitfield;
use crate::torrent::{PieceIndex, PiecePriority};

/// Per-piece priority table plus the set of pieces currently being fetched.
///
/// Selection takes the highest priority first and the lowest index within a
/// level, restricted to pieces the asking peer holds.
#[derive(Debug)]
pub(crate) struct PiecePicker {
    priorities: Vec<PiecePriority>,
    in_flight: Vec<bool>,
}

impl PiecePicker {
    pub(crate) fn new(piece_count: u32) -> Self {
        Self {
            priorities: vec![PiecePriority::Normal; piece_count as usize],
            in_flight: vec![false; piece_count as usize],
        }
    }

    /// Sets `level` for every piece in `pieces`, ignoring indices past the end.
    pub(crate) fn set_priority(&mut self, pieces: Range<u32>, level: PiecePriority) {
        let end = (pieces.end as usize).min(self.priorities.len());
        let start = (pieces.start as usize).min(end);
        for priority in &mut self.priorities[start..end] {
            *priority = level;
        }
    }

    pub(crate) fn priority(&self, index: PieceIndex) -> PiecePriority {
        self.priorities
            .get(index.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// Claims the best piece `peer_has` offers and marks it in flight.
    pub(crate) fn pick(&mut self, peer_has: &Bitfield, store: &PieceStore) -> Option<PieceIndex> {
        let mut best: Option<(PiecePriority, PieceIndex)> = None;
        for index in peer_has.iter_set() {
            let slot = index.as_usize();
            if slot >= self.priorities.len() || self.in_flight[slot] || store.is_complete(index) {
                continue;
            }
            let priority = self.priorities[slot];
            // iter_set walks ascending indices, so only a strictly higher level replaces.
            if best.is_none_or(|(current, _)| priority > current) {
                best = Some((priority, index));
                if priority == PiecePriority::Critical {
                    break;
                }
            }
        }

        let (_, index) = best?;
        self.in_flight[index.as_usize()] = true;
        store.mark_requested(index);
        Some(index)
    }

    /// Whether `peer_has` holds anything we still need.
    pub(crate) fn wants_any(&self, peer_has: &Bitfield, store: &PieceStore) -> bool {
        peer_has.iter_set().any(|index| {
            index.as_usize() < self.priorities.len() && !store.is_complete(index)
        })
    }

    /// Returns a claimed piece to the pool after a failure or peer loss.
    pub(crate) fn release(&mut self, index: PieceIndex) {
        if let Some(flag) = self.in_flight.get_mut(index.as_usize()) {
            *flag = false;
        }
    }

    /// Clears the in-flight claim of a piece that has been written.
    pub(crate) fn complete(&mut self, index: PieceIndex) {
        self.release(index);
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, index: PieceIndex) -> bool {
        self.in_flight
            .get(index.as_usize())
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::torrent::parsing::{BencodeParser, BencodeValue};

    fn store(dir: &std::path::Path) -> PieceStore {
        let info = BencodeValue::dictionary()
            .with("name", "f.bin")
            .with("piece length", 4i64)
            .with("length", 40i64)
            .with("pieces", vec![0u8; 10 * 20])
            .encode();
        let metadata = BencodeParser::parse_info_dictionary(&info, Vec::new()).unwrap();
        PieceStore::new(Arc::new(metadata), dir)
    }

    #[test]
    fn test_picks_lowest_index_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut picker = PiecePicker::new(10);
        let peer = Bitfield::full(10);

        assert_eq!(picker.pick(&peer, &store), Some(PieceIndex::new(0)));
        assert_eq!(picker.pick(&peer, &store), Some(PieceIndex::new(1)));
        assert!(picker.is_in_flight(PieceIndex::new(0)));
    }

    #[test]
    fn test_higher_priority_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut picker = PiecePicker::new(10);
        picker.set_priority(0..5, PiecePriority::Low);
        picker.set_priority(7..9, PiecePriority::Critical);
        picker.set_priority(9..20, PiecePriority::High);
        let peer = Bitfield::full(10);

        let order: Vec<u32> = std::iter::from_fn(|| picker.pick(&peer, &store))
            .map(PieceIndex::as_u32)
            .collect();
        assert_eq!(order, vec![7, 8, 9, 5, 6, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_only_pieces_peer_holds() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut picker = PiecePicker::new(10);
        let mut peer = Bitfield::new(10);
        peer.set(PieceIndex::new(6));

        assert!(picker.wants_any(&peer, &store));
        assert_eq!(picker.pick(&peer, &store), Some(PieceIndex::new(6)));
        assert_eq!(picker.pick(&peer, &store), None);

        picker.release(PieceIndex::new(6));
        assert_eq!(picker.pick(&peer, &store), Some(PieceIndex::new(6)));
    }
}
