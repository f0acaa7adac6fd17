//! Centralized configuration for Eddy.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Eddy components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct EddyConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub scheduler: SchedulerConfig,
    pub remux: RemuxConfig,
    pub subtitles: SubtitleConfig,
    pub search: SearchConfig,
}

/// BitTorrent protocol-specific configuration.
///
/// Controls block requests, verification timeouts and session health checks.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier prefix for generated peer IDs
    pub client_id: &'static str,
    /// Size of a single block request
    pub block_size: u32,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
    /// Time a peer may hold an unanswered request before it is dropped
    pub piece_timeout: Duration,
    /// Bound on magnet metadata resolution
    pub metadata_timeout: Duration,
    /// Time without peers or progress before a session is reported stalled
    pub stall_timeout: Duration,
    /// Port announced to trackers
    pub listen_port: u16,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-ED0001-",
            block_size: 16_384, // 16 KiB
            pipeline_depth: 8,
            piece_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(60),
            listen_port: 6881,
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls HTTP timeouts, peer connection limits and discovery cadence.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Maximum concurrent peer connections per torrent
    pub max_peer_connections: usize,
    /// TCP connect plus handshake timeout
    pub peer_connect_timeout: Duration,
    /// Idle time after which a silent peer is disconnected
    pub peer_idle_timeout: Duration,
    /// Interval between peer discovery rounds
    pub discovery_interval: Duration,
    /// Delay before a failed peer address is retried
    pub peer_retry_delay: Duration,
    /// Number of interested peers we unchoke for uploads
    pub upload_slots: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            user_agent: "eddy/0.1.0",
            max_peer_connections: 50,
            peer_connect_timeout: Duration::from_secs(10),
            peer_idle_timeout: Duration::from_secs(120),
            discovery_interval: Duration::from_secs(30),
            peer_retry_delay: Duration::from_secs(60),
            upload_slots: 4,
        }
    }
}

/// Where downloaded content lands on disk.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for torrent payloads
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
        }
    }
}

/// HTTP streaming configuration.
///
/// Controls how long range requests wait on missing pieces and how the
/// server paces status pushes.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Address the streaming server binds to
    pub bind_address: SocketAddr,
    /// Bound on waiting for a single piece while serving a GET
    pub wait_timeout: Duration,
    /// Largest chunk yielded to the HTTP body at once
    pub chunk_size: usize,
    /// Bytes ahead of the read cursor escalated for an active GET
    pub escalation_bytes: u64,
    /// Interval between status channel messages
    pub status_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            wait_timeout: Duration::from_secs(30),
            chunk_size: 256 * 1024,
            escalation_bytes: 8 * 1024 * 1024,
            status_interval: Duration::from_secs(2),
        }
    }
}

/// Playback-driven priority scheduling configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Forward window raised on playback position updates
    pub playback_window_bytes: u64,
    /// Window used for seeks that do not name one
    pub default_seek_window_bytes: u64,
    /// Minimum spacing between applied window updates
    pub throttle: Duration,
    /// Pieces at the head of a file fetched on stream start
    pub critical_head_pieces: u32,
    /// Pieces at the tail of a file fetched on stream start
    pub critical_tail_pieces: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            playback_window_bytes: 32 * 1024 * 1024,
            default_seek_window_bytes: 64 * 1024 * 1024,
            throttle: Duration::from_millis(300),
            critical_head_pieces: 2,
            critical_tail_pieces: 2,
        }
    }
}

/// Container remux configuration.
#[derive(Debug, Clone)]
pub struct RemuxConfig {
    /// ffmpeg binary to invoke
    pub ffmpeg_path: PathBuf,
    /// Directory for remuxed outputs
    pub cache_dir: PathBuf,
    /// Remux jobs kept in memory before the least recently used is evicted
    pub max_cached_jobs: usize,
    /// Bound on waiting for any single source piece during a remux
    pub source_wait_timeout: Duration,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            cache_dir: PathBuf::from("downloads/.remux"),
            max_cached_jobs: 32,
            source_wait_timeout: Duration::from_secs(600),
        }
    }
}

/// Subtitle provider configuration.
#[derive(Debug, Clone)]
pub struct SubtitleConfig {
    /// REST API root of the subtitle provider
    pub api_base_url: String,
    /// API key, subtitle search is disabled without one
    pub api_key: Option<String>,
    /// User agent sent to the provider
    pub user_agent: &'static str,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.opensubtitles.com/api/v1".to_string(),
            api_key: None,
            user_agent: "eddy v0.1.0",
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Torrent search provider configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Base URL of the search indexer API
    pub base_url: String,
    /// Optional indexer API key
    pub api_key: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
        }
    }
}

impl EddyConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("EDDY_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(&dir);
            config.remux.cache_dir = PathBuf::from(dir).join(".remux");
        }

        if let Ok(timeout) = std::env::var("EDDY_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max_peers) = std::env::var("EDDY_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.network.max_peer_connections = count;
            }
        }

        if let Ok(timeout) = std::env::var("EDDY_STREAM_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.streaming.wait_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(address) = std::env::var("EDDY_BIND_ADDRESS") {
            if let Ok(address) = address.parse::<SocketAddr>() {
                config.streaming.bind_address = address;
            }
        }

        if let Ok(path) = std::env::var("EDDY_FFMPEG_PATH") {
            config.remux.ffmpeg_path = PathBuf::from(path);
        }

        if let Ok(key) = std::env::var("EDDY_OPENSUBTITLES_API_KEY") {
            if !key.is_empty() {
                config.subtitles.api_key = Some(key);
            }
        }

        if let Ok(url) = std::env::var("EDDY_SEARCH_URL") {
            config.search.base_url = url;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timeouts and fast discovery keep simulated swarms quick. Storage
    /// paths still need to be pointed at a temporary directory by the caller.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.torrent.metadata_timeout = Duration::from_millis(500);
        config.torrent.stall_timeout = Duration::from_secs(2);
        config.torrent.piece_timeout = Duration::from_secs(2);
        config.network.peer_connect_timeout = Duration::from_millis(500);
        config.network.peer_idle_timeout = Duration::from_secs(5);
        config.network.discovery_interval = Duration::from_millis(50);
        config.network.peer_retry_delay = Duration::from_millis(100);
        config.streaming.wait_timeout = Duration::from_secs(2);
        config.streaming.status_interval = Duration::from_millis(50);
        config.scheduler.throttle = Duration::from_millis(300);
        config.remux.source_wait_timeout = Duration::from_secs(5);
        config
    }

    /// Points every on-disk location under `root`.
    pub fn with_data_dir(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.remux.cache_dir = root.join(".remux");
        self.storage.download_dir = root;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = EddyConfig::default();

        assert_eq!(config.torrent.client_id, "-ED0001-");
        assert_eq!(config.torrent.block_size, 16_384);
        assert_eq!(config.network.max_peer_connections, 50);
        assert_eq!(config.network.tracker_timeout, Duration::from_secs(30));
        assert_eq!(config.scheduler.throttle, Duration::from_millis(300));
        assert_eq!(config.streaming.status_interval, Duration::from_secs(2));
        assert!(config.subtitles.api_key.is_none());
    }

    #[test]
    fn test_testing_preset_shortens_timeouts() {
        let config = EddyConfig::for_testing();
        let defaults = EddyConfig::default();

        assert!(config.torrent.metadata_timeout < defaults.torrent.metadata_timeout);
        assert!(config.network.discovery_interval < defaults.network.discovery_interval);
        assert!(config.streaming.wait_timeout < defaults.streaming.wait_timeout);
        // Window throttling is part of scheduling semantics and stays put.
        assert_eq!(config.scheduler.throttle, defaults.scheduler.throttle);
    }

    #[test]
    fn test_with_data_dir() {
        let config = EddyConfig::default().with_data_dir("/tmp/eddy");
        assert_eq!(config.storage.download_dir, PathBuf::from("/tmp/eddy"));
        assert_eq!(config.remux.cache_dir, PathBuf::from("/tmp/eddy/.remux"));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("EDDY_TRACKER_TIMEOUT", "60");
            std::env::set_var("EDDY_MAX_PEERS", "100");
            std::env::set_var("EDDY_BIND_ADDRESS", "0.0.0.0:8080");
            std::env::set_var("EDDY_OPENSUBTITLES_API_KEY", "secret");
        }

        let config = EddyConfig::from_env();

        assert_eq!(config.network.tracker_timeout, Duration::from_secs(60));
        assert_eq!(config.network.max_peer_connections, 100);
        assert_eq!(config.streaming.bind_address.port(), 8080);
        assert_eq!(config.subtitles.api_key.as_deref(), Some("secret"));

        unsafe {
            std::env::remove_var("EDDY_TRACKER_TIMEOUT");
            std::env::remove_var("EDDY_MAX_PEERS");
            std::env::remove_var("EDDY_BIND_ADDRESS");
            std::env::remove_var("EDDY_OPENSUBTITLES_API_KEY");
        }
    }
}
