//! Swarm sessions: one per torrent, owning its peer connections.
//!
//! A session is a coordinator task plus one task per connected peer. The
//! piece store is the single source of truth for completion; the picker and
//! availability counters only steer which pieces are requested next.

pub mod discovery;
mod metadata;
pub mod peer;
mod picker;
mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod simulation;
mod stats;
mod worker;

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub use discovery::{DiscoveryRequest, PeerDiscovery, StaticDiscovery, SwarmTransport, TrackerDiscovery};
pub(crate) use metadata::fetch_metadata;
pub use peer::{PeerChannel, PeerConnector, StreamChannel, TcpConnector};

use self::picker::PiecePicker;
use self::stats::{Availability, SwarmStats};
use crate::config::{EddyConfig, NetworkConfig, TorrentConfig};
use crate::scheduler::{PriorityScheduler, PrioritySink};
use crate::storage::{PieceStore, StorageError};
use crate::torrent::protocol::PeerId;
use crate::torrent::{InfoHash, PieceIndex, PiecePriority, TorrentError, TorrentMetadata};

/// Lifecycle of a session as reported in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// Magnet metadata is still being resolved
    FetchingMetadata = 0,
    Downloading = 1,
    /// Every piece verified; the session keeps serving uploads
    Complete = 2,
    /// No connected peers and no progress for the stall timeout
    Stalled = 3,
    Closed = 4,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::FetchingMetadata,
            1 => Self::Downloading,
            2 => Self::Complete,
            3 => Self::Stalled,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FetchingMetadata => "fetching_metadata",
            Self::Downloading => "downloading",
            Self::Complete => "complete",
            Self::Stalled => "stalled",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session. Built from atomics without locking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub progress_percent: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peer_count: usize,
    pub state: SessionState,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub completed_pieces: u32,
    pub total_pieces: u32,
}

impl SessionSnapshot {
    /// Snapshot of a torrent whose metadata is not known yet.
    pub fn fetching_metadata() -> Self {
        Self {
            progress_percent: 0.0,
            download_rate: 0,
            upload_rate: 0,
            peer_count: 0,
            state: SessionState::FetchingMetadata,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            completed_pieces: 0,
            total_pieces: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    SetPriority {
        pieces: Range<u32>,
        level: PiecePriority,
    },
}

/// State shared between the coordinator, peer workers and handles.
pub(crate) struct SessionShared {
    pub(crate) info_hash: InfoHash,
    pub(crate) metadata: Arc<TorrentMetadata>,
    pub(crate) store: Arc<PieceStore>,
    pub(crate) picker: Mutex<PiecePicker>,
    pub(crate) stats: SwarmStats,
    pub(crate) availability: Availability,
    pub(crate) upload_slots: Arc<Semaphore>,
    pub(crate) peer_id: PeerId,
    pub(crate) torrent_config: TorrentConfig,
    pub(crate) network_config: NetworkConfig,
    pub(crate) cancel: CancellationToken,
    /// Verified pieces, fanned out so every worker can send `have`
    pub(crate) completions: broadcast::Sender<PieceIndex>,
    state: AtomicU8,
    started: Instant,
    last_progress_ms: AtomicU64,
}

impl SessionShared {
    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Moves to `state` unless the session is already closed.
    pub(crate) fn set_state(&self, state: SessionState) -> SessionState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == SessionState::Closed as u8 {
                return SessionState::Closed;
            }
            match self.state.compare_exchange(
                current,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return SessionState::from_raw(previous),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn record_progress(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_progress_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last verified piece or session start.
    pub(crate) fn since_progress(&self) -> std::time::Duration {
        let last = self.last_progress_ms.load(Ordering::Acquire);
        self.started
            .elapsed()
            .saturating_sub(std::time::Duration::from_millis(last))
    }
}

/// Priority changes routed into a session's command queue.
#[derive(Debug, Clone)]
pub struct PriorityControl {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl PrioritySink for PriorityControl {
    fn set_priority(&self, pieces: Range<u32>, level: PiecePriority) {
        let _ = self
            .commands
            .send(SessionCommand::SetPriority { pieces, level });
    }
}

/// Cloneable handle to one running swarm session.
#[derive(Clone)]
pub struct TorrentHandle {
    shared: Arc<SessionShared>,
    scheduler: Arc<PriorityScheduler>,
}

impl std::fmt::Debug for TorrentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentHandle")
            .field("info_hash", &self.shared.info_hash)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl TorrentHandle {
    /// Starts a session for `metadata` and begins downloading.
    ///
    /// Payload files land under `<download_dir>/<info hash>/`.
    pub fn spawn(metadata: TorrentMetadata, config: &EddyConfig, transport: SwarmTransport) -> Self {
        let metadata = Arc::new(metadata);
        let info_hash = metadata.info_hash;
        let download_dir = config.storage.download_dir.join(info_hash.to_string());
        let store = Arc::new(PieceStore::new(Arc::clone(&metadata), download_dir));
        let cancel = CancellationToken::new();

        let shared = Arc::new(SessionShared {
            info_hash,
            picker: Mutex::new(PiecePicker::new(metadata.piece_count())),
            availability: Availability::new(metadata.piece_count()),
            metadata: Arc::clone(&metadata),
            store,
            stats: SwarmStats::default(),
            upload_slots: Arc::new(Semaphore::new(config.network.upload_slots)),
            peer_id: PeerId::generate(config.torrent.client_id),
            torrent_config: config.torrent.clone(),
            network_config: config.network.clone(),
            cancel: cancel.clone(),
            completions: broadcast::channel(256).0,
            state: AtomicU8::new(SessionState::Downloading as u8),
            started: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let control = PriorityControl { commands };
        let scheduler = PriorityScheduler::spawn(
            metadata,
            config.scheduler.clone(),
            Arc::new(control),
            cancel.child_token(),
        );

        tokio::spawn(session::run_session(
            Arc::clone(&shared),
            command_rx,
            transport,
        ));
        tracing::info!(info_hash = %info_hash, name = %shared.metadata.name, "Swarm session started");

        Self { shared, scheduler }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.shared.metadata
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.shared.store
    }

    /// Playback-driven priority scheduler of this session.
    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Progress, rates and peer count. Never blocks.
    pub fn snapshot(&self) -> SessionSnapshot {
        let store = &self.shared.store;
        let stats = &self.shared.stats;
        let total = store.piece_count();
        let completed = store.completed_count();
        let progress_percent = if total == 0 {
            100.0
        } else {
            f64::from(completed) * 100.0 / f64::from(total)
        };

        SessionSnapshot {
            progress_percent,
            download_rate: stats.download_rate.load(Ordering::Relaxed),
            upload_rate: stats.upload_rate.load(Ordering::Relaxed),
            peer_count: stats.connected_peers.load(Ordering::Relaxed),
            state: self.shared.state(),
            downloaded_bytes: stats.downloaded.load(Ordering::Relaxed),
            uploaded_bytes: stats.uploaded.load(Ordering::Relaxed),
            completed_pieces: completed,
            total_pieces: total,
        }
    }

    /// Pins the level of a piece range through the scheduler, so later
    /// window moves keep it instead of overwriting it.
    pub fn set_priority(&self, pieces: Range<u32>, level: PiecePriority) {
        self.scheduler.set_manual_priority(pieces, level);
    }

    /// Current priority of a piece as seen by the picker.
    pub fn piece_priority(&self, index: PieceIndex) -> PiecePriority {
        self.shared.picker.lock().priority(index)
    }

    /// Whether every piece overlapping the byte range of a file is complete.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - Unknown file index
    pub fn piece_available(
        &self,
        file_index: usize,
        byte_offset: u64,
        length: u64,
    ) -> Result<bool, TorrentError> {
        let metadata = &self.shared.metadata;
        let file = metadata.file(file_index)?;
        let pieces = file.pieces_for_bytes(byte_offset, length, metadata.piece_length);
        Ok(self.shared.store.range_complete(pieces))
    }

    /// Completed share of one file, in percent.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - Unknown file index
    pub fn file_progress(&self, file_index: usize) -> Result<f64, TorrentError> {
        let file = self.shared.metadata.file(file_index)?;
        let total = file.pieces.len() as u32;
        if total == 0 {
            return Ok(100.0);
        }
        let done = self.shared.store.completed_in(file.pieces.clone());
        Ok(f64::from(done) * 100.0 / f64::from(total))
    }

    /// Number of connected peers advertising `index`.
    pub fn piece_availability(&self, index: PieceIndex) -> u32 {
        self.shared.availability.count(index)
    }

    /// Connected peers that have reported which pieces they hold.
    pub fn peers_reported(&self) -> usize {
        self.shared.availability.reporting_peers()
    }

    /// Waits for a piece to complete.
    ///
    /// # Errors
    /// - `TorrentError::SessionClosed` - The session closed first
    /// - `TorrentError::Storage` - Index out of range
    pub async fn wait_for_piece(&self, index: PieceIndex) -> Result<(), TorrentError> {
        self.shared
            .store
            .wait_for_piece(index)
            .await
            .map_err(|e| self.closed_or(e))
    }

    /// Stops peer I/O and optionally deletes downloaded data. Idempotent.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Data deletion failed
    pub async fn close(&self, delete_data: bool) -> Result<(), TorrentError> {
        let already = self.shared.cancel.is_cancelled();
        self.shared.cancel.cancel();
        self.shared.store.close();
        self.shared.state.store(SessionState::Closed as u8, Ordering::Release);
        if !already {
            tracing::info!(info_hash = %self.shared.info_hash, delete_data, "Swarm session closed");
        }

        if delete_data {
            self.shared.store.delete_data().await?;
        }
        Ok(())
    }

    /// Maps store closure to the session-level error.
    pub(crate) fn closed_or(&self, error: StorageError) -> TorrentError {
        match error {
            StorageError::Closed { info_hash } => TorrentError::SessionClosed { info_hash },
            other => TorrentError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::simulation::{PeerBehavior, SimulatedSwarm, SimulatedTorrent, random_content};
    use super::*;

    fn config(dir: &std::path::Path) -> EddyConfig {
        EddyConfig::for_testing().with_data_dir(dir)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_downloads_from_seeded_swarm() {
        let dir = tempfile::tempdir().unwrap();
        let content = random_content(10 * 16_384 + 123, 7);
        let torrent = SimulatedTorrent::single_file("clip.mp4", content.clone(), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        swarm.add_seeder(torrent.info_hash());
        swarm.add_seeder(torrent.info_hash());

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        wait_until(|| handle.snapshot().state == SessionState::Complete).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.progress_percent, 100.0);
        assert_eq!(snapshot.completed_pieces, 11);
        assert!(snapshot.downloaded_bytes >= content.len() as u64);

        let bytes = handle
            .store()
            .read_file_range(0, 0, content.len() as u64)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), content.as_slice());
        assert!(handle.piece_available(0, 0, content.len() as u64).unwrap());
        handle.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = SimulatedTorrent::single_file("a.mkv", random_content(4 * 16_384, 1), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_piece(PieceIndex::new(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.close(false).await.unwrap();
        handle.close(true).await.unwrap();
        assert_eq!(handle.snapshot().state, SessionState::Closed);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TorrentError::SessionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_peers_reports_stalled() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = SimulatedTorrent::single_file("a.mp4", random_content(16_384, 2), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        wait_until(|| handle.snapshot().state == SessionState::Stalled).await;
        assert_eq!(handle.snapshot().peer_count, 0);

        // A seeder showing up recovers the session.
        swarm.add_seeder(torrent.info_hash());
        wait_until(|| handle.snapshot().state == SessionState::Complete).await;
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_peers_drive_availability() {
        let dir = tempfile::tempdir().unwrap();
        let torrent =
            SimulatedTorrent::single_file("a.mp4", random_content(10 * 16_384, 3), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        swarm.add_peer(torrent.info_hash(), (0..10).filter(|p| *p != 7));

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        wait_until(|| handle.snapshot().completed_pieces == 9).await;

        assert_eq!(handle.peers_reported(), 1);
        assert_eq!(handle.piece_availability(PieceIndex::new(7)), 0);
        assert_eq!(handle.piece_availability(PieceIndex::new(6)), 1);
        assert!(!handle.piece_available(0, 7 * 16_384, 1).unwrap());
        assert!(handle.piece_available(0, 0, 7 * 16_384).unwrap());
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_seek_window_downloads_before_distant_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let torrent =
            SimulatedTorrent::single_file("movie.mp4", random_content(60 * 16_384, 9), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        let slow = PeerBehavior {
            block_delay: Duration::from_millis(20),
            ..PeerBehavior::default()
        };
        swarm.add_peer_with(torrent.info_hash(), 0..60, slow);

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        handle
            .scheduler()
            .on_seek(0, 40 * 16_384, Some(4 * 16_384 - 1))
            .unwrap();

        for piece in 40..44 {
            tokio::time::timeout(
                Duration::from_secs(10),
                handle.wait_for_piece(PieceIndex::new(piece)),
            )
            .await
            .expect("window piece never arrived")
            .unwrap();
        }
        assert_eq!(
            handle.piece_priority(PieceIndex::new(40)),
            PiecePriority::Critical
        );

        // At most the piece claimed before the window reached the picker,
        // plus the one started right after the window, may beat it.
        let store = handle.store();
        let elsewhere = (0..60u32)
            .filter(|piece| !(40..44).contains(piece))
            .filter(|piece| store.is_complete(PieceIndex::new(*piece)))
            .count();
        assert!(elsewhere <= 2, "{elsewhere} pieces outside the window finished first");
        assert!(!store.is_complete(PieceIndex::new(59)));
        assert!(!store.is_complete(PieceIndex::new(20)));
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_uploads_to_leechers() {
        let dir = tempfile::tempdir().unwrap();
        let torrent =
            SimulatedTorrent::single_file("a.mp4", random_content(8 * 16_384, 5), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        let slow = PeerBehavior {
            block_delay: Duration::from_millis(20),
            ..PeerBehavior::default()
        };
        swarm.add_peer_with(torrent.info_hash(), 0..8, slow);
        let leech = PeerBehavior {
            leech: true,
            ..PeerBehavior::default()
        };
        swarm.add_peer_with(torrent.info_hash(), std::iter::empty(), leech);

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        wait_until(|| handle.snapshot().state == SessionState::Complete).await;
        wait_until(|| swarm.leeched_bytes() > 0).await;
        assert!(handle.snapshot().uploaded_bytes > 0);
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_peer_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let content = random_content(6 * 16_384, 4);
        let torrent = SimulatedTorrent::single_file("a.mp4", content.clone(), 16_384);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        swarm.add_corrupt_seeder(torrent.info_hash());
        swarm.add_seeder(torrent.info_hash());

        let handle = TorrentHandle::spawn(
            torrent.metadata.as_ref().clone(),
            &config(dir.path()),
            swarm.transport(),
        );
        wait_until(|| handle.snapshot().state == SessionState::Complete).await;
        let bytes = handle
            .store()
            .read_file_range(0, 0, content.len() as u64)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), content.as_slice());
        handle.close(false).await.unwrap();
    }
}
