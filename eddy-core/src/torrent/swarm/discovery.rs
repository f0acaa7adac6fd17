//! Peer discovery sources.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::peer::{PeerConnector, TcpConnector};
use crate::config::{EddyConfig, NetworkConfig};
use crate::torrent::protocol::PeerId;
use crate::torrent::tracker::{AnnounceEvent, AnnounceRequest, HttpTrackerClient, TrackerClient};
use crate::torrent::{InfoHash, TorrentError};

/// What a session tells discovery sources about itself.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub trackers: Vec<String>,
}

/// A source of candidate peer addresses.
///
/// Called once per discovery round. Implementations absorb their own
/// failures; an unreachable tracker simply contributes no peers.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(&self, request: &DiscoveryRequest) -> Vec<SocketAddr>;
}

/// Connector and discovery pair a session uses to reach its swarm.
#[derive(Clone)]
pub struct SwarmTransport {
    pub connector: Arc<dyn PeerConnector>,
    pub discovery: Arc<dyn PeerDiscovery>,
}

impl SwarmTransport {
    pub fn new(connector: Arc<dyn PeerConnector>, discovery: Arc<dyn PeerDiscovery>) -> Self {
        Self {
            connector,
            discovery,
        }
    }

    /// TCP peers found through HTTP trackers.
    ///
    /// # Errors
    /// - `TorrentError::Http` - If the tracker HTTP client cannot be built
    pub fn tcp(config: &EddyConfig) -> Result<Self, TorrentError> {
        Ok(Self::new(
            Arc::new(TcpConnector::new(config.network.peer_connect_timeout)),
            Arc::new(TrackerDiscovery::new(&config.network)?),
        ))
    }
}

impl std::fmt::Debug for SwarmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmTransport").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct AnnounceSchedule {
    next: Instant,
    started: bool,
}

/// Discovers peers by announcing to each HTTP tracker of a torrent.
///
/// Trackers are only contacted again after the interval they asked for;
/// failing trackers are retried after the configured retry delay.
pub struct TrackerDiscovery {
    client: reqwest::Client,
    retry_delay: Duration,
    schedule: Mutex<HashMap<(InfoHash, String), AnnounceSchedule>>,
}

impl TrackerDiscovery {
    /// # Errors
    /// - `TorrentError::Http` - If the HTTP client cannot be built
    pub fn new(config: &NetworkConfig) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self {
            client,
            retry_delay: config.peer_retry_delay,
            schedule: Mutex::new(HashMap::new()),
        })
    }

    fn due(&self, info_hash: InfoHash, tracker: &str, now: Instant) -> Option<bool> {
        let schedule = self.schedule.lock();
        match schedule.get(&(info_hash, tracker.to_string())) {
            Some(entry) if entry.next > now => None,
            Some(entry) => Some(entry.started),
            None => Some(false),
        }
    }

    fn reschedule(&self, info_hash: InfoHash, tracker: &str, next: Instant, started: bool) {
        self.schedule.lock().insert(
            (info_hash, tracker.to_string()),
            AnnounceSchedule { next, started },
        );
    }
}

#[async_trait]
impl PeerDiscovery for TrackerDiscovery {
    async fn discover(&self, request: &DiscoveryRequest) -> Vec<SocketAddr> {
        let mut peers = Vec::new();

        for tracker in &request.trackers {
            match url::Url::parse(tracker) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(tracker = %tracker, error = %e, "Skipping malformed tracker URL");
                    continue;
                }
            }
            let now = Instant::now();
            let Some(started) = self.due(request.info_hash, tracker, now) else {
                continue;
            };

            let client = HttpTrackerClient::with_client(tracker.clone(), self.client.clone());
            let announce = AnnounceRequest {
                info_hash: request.info_hash,
                peer_id: request.peer_id,
                port: request.port,
                uploaded: request.uploaded,
                downloaded: request.downloaded,
                left: request.left,
                event: (!started).then_some(AnnounceEvent::Started),
            };

            match client.announce(&announce).await {
                Ok(response) => {
                    let interval = response.min_interval.unwrap_or(response.interval).max(1);
                    tracing::debug!(
                        info_hash = %request.info_hash,
                        tracker = %tracker,
                        peers = response.peers.len(),
                        seeders = response.complete,
                        "Tracker announce succeeded"
                    );
                    self.reschedule(
                        request.info_hash,
                        tracker,
                        now + Duration::from_secs(u64::from(interval)),
                        true,
                    );
                    peers.extend(response.peers);
                }
                Err(e) => {
                    tracing::warn!(
                        info_hash = %request.info_hash,
                        tracker = %tracker,
                        error = %e,
                        "Tracker announce failed"
                    );
                    self.reschedule(request.info_hash, tracker, now + self.retry_delay, started);
                }
            }
        }

        peers.sort();
        peers.dedup();
        peers
    }
}

/// Fixed peer list, for LAN seeders and manual peers.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn discover(&self, _request: &DiscoveryRequest) -> Vec<SocketAddr> {
        self.peers.clone()
    }
}
