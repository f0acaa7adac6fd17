//! Core types for BitTorrent tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::protocol::PeerId;
use crate::torrent::{InfoHash, TorrentError};

/// Tracker announce request.
///
/// Contains client statistics and torrent information sent to tracker
/// during announce operations to report progress and request peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's unique 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port client is listening on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    /// Lifecycle event, `None` for regular interval announces
    pub event: Option<AnnounceEvent>,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
    /// Client completed downloading this torrent
    Completed,
}

impl AnnounceEvent {
    /// Tracker protocol name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until next announce request should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Number of seeders in the swarm
    pub complete: u32,
    /// Number of leechers in the swarm
    pub incomplete: u32,
    /// List of peer addresses for connection attempts
    pub peers: Vec<SocketAddr>,
}

/// Abstract tracker communication interface.
///
/// Implementations handle transport details while keeping error handling
/// and response parsing consistent.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces client presence to tracker and retrieves peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - If network or HTTP error
    /// - `TorrentError::TrackerRejected` - If the tracker returned a failure reason
    /// - `TorrentError::ProtocolError` - If invalid tracker response format
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str;
}
