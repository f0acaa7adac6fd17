//! Lock-free transfer counters and rate estimation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crate::torrent::PieceIndex;
use crate::torrent::protocol::Bitfield;

/// Number of ticker samples kept for rate estimation.
const RATE_WINDOW: usize = 5;

/// Counters updated by peer workers and read by snapshots.
#[derive(Debug, Default)]
pub(crate) struct SwarmStats {
    pub(crate) downloaded: AtomicU64,
    pub(crate) uploaded: AtomicU64,
    pub(crate) download_rate: AtomicU64,
    pub(crate) upload_rate: AtomicU64,
    pub(crate) connected_peers: AtomicUsize,
}

impl SwarmStats {
    pub(crate) fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn peer_connected(&self) {
        self.connected_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn peer_disconnected(&self) {
        self.connected_peers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Sliding-window bytes-per-second estimate driven by the session ticker.
#[derive(Debug)]
pub(crate) struct RateTracker {
    samples: VecDeque<(Instant, u64, u64)>,
}

impl RateTracker {
    pub(crate) fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RATE_WINDOW + 1),
        }
    }

    /// Records current totals and publishes fresh rates into `stats`.
    pub(crate) fn tick(&mut self, stats: &SwarmStats, now: Instant) {
        let downloaded = stats.downloaded.load(Ordering::Relaxed);
        let uploaded = stats.uploaded.load(Ordering::Relaxed);
        self.samples.push_back((now, downloaded, uploaded));
        while self.samples.len() > RATE_WINDOW {
            self.samples.pop_front();
        }

        let Some(&(oldest_at, oldest_down, oldest_up)) = self.samples.front() else {
            return;
        };
        let elapsed = now.duration_since(oldest_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let rate = |now: u64, then: u64| (now.saturating_sub(then) as f64 / elapsed) as u64;
        stats
            .download_rate
            .store(rate(downloaded, oldest_down), Ordering::Relaxed);
        stats
            .upload_rate
            .store(rate(uploaded, oldest_up), Ordering::Relaxed);
    }
}

/// How many connected peers advertise each piece.
#[derive(Debug)]
pub(crate) struct Availability {
    counts: Box<[AtomicU32]>,
    reporting_peers: AtomicUsize,
}

impl Availability {
    pub(crate) fn new(piece_count: u32) -> Self {
        Self {
            counts: (0..piece_count).map(|_| AtomicU32::new(0)).collect(),
            reporting_peers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn count(&self, index: PieceIndex) -> u32 {
        self.counts
            .get(index.as_usize())
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Peers currently connected that have told us what they hold.
    pub(crate) fn reporting_peers(&self) -> usize {
        self.reporting_peers.load(Ordering::Acquire)
    }

    pub(crate) fn peer_reported(&self) {
        self.reporting_peers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn add_piece(&self, index: PieceIndex) {
        if let Some(count) = self.counts.get(index.as_usize()) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Forgets a departed peer and every piece it advertised.
    pub(crate) fn remove_peer(&self, held: &Bitfield, reported: bool) {
        for index in held.iter_set() {
            if let Some(count) = self.counts.get(index.as_usize()) {
                count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if reported {
            self.reporting_peers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_rate_over_window() {
        let stats = SwarmStats::default();
        let mut tracker = RateTracker::new();
        let start = Instant::now();

        tracker.tick(&stats, start);
        stats.add_downloaded(4_000);
        stats.add_uploaded(1_000);
        tracker.tick(&stats, start + Duration::from_secs(2));

        assert_eq!(stats.download_rate.load(Ordering::Relaxed), 2_000);
        assert_eq!(stats.upload_rate.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn test_availability_tracks_departures() {
        let availability = Availability::new(4);
        let mut held = Bitfield::new(4);
        held.set(PieceIndex::new(2));

        availability.peer_reported();
        availability.add_piece(PieceIndex::new(2));
        assert_eq!(availability.count(PieceIndex::new(2)), 1);
        assert_eq!(availability.reporting_peers(), 1);

        availability.remove_peer(&held, true);
        assert_eq!(availability.count(PieceIndex::new(2)), 0);
        assert_eq!(availability.reporting_peers(), 0);
    }
}
