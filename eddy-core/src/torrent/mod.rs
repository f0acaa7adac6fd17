//! BitTorrent protocol implementation optimized for streaming

pub mod engine;
pub mod parsing;
pub mod protocol;
pub mod swarm;
pub mod tracker;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub use engine::{EngineHandle, TorrentSource, spawn_engine};
pub use parsing::{BencodeParser, FileEntry, MagnetLink, MagnetParser, TorrentMetadata};
pub use protocol::{PeerId, PeerMessage};
pub use swarm::{SessionSnapshot, SessionState, SwarmTransport, TorrentHandle};
pub use tracker::HttpTrackerClient;

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    /// Parses the 40 character hex form used in URLs and action parameters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TorrentError::InvalidInfoHash {
            value: s.to_string(),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::InvalidInfoHash {
                value: s.to_string(),
            })?;
        Ok(Self(hash))
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fetch ordering level of a piece.
///
/// Higher levels are requested first. `Low` is the baseline for pieces the
/// playhead has already passed: they still complete eventually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PiecePriority {
    /// Background completion, behind the playhead
    Low = 0,
    /// Standard sequential download
    #[default]
    Normal = 1,
    /// Container structure at the head and tail of a file
    High = 2,
    /// Needed for the current playback window or a blocked read
    Critical = 3,
}

impl FromStr for PiecePriority {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" | "urgent" => Ok(Self::Critical),
            _ => Err(TorrentError::InvalidPriority {
                value: s.to_string(),
            }),
        }
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers parsing, peer protocol and tracker failures, plus the terminal
/// session conditions surfaced to streaming callers.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid info hash: {value}")]
    InvalidInfoHash { value: String },

    #[error("Invalid piece priority: {value}")]
    InvalidPriority { value: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker rejected announce: {reason}")]
    TrackerRejected { reason: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} has no file {file_index}")]
    FileNotFound { info_hash: InfoHash, file_index: usize },

    #[error("No peer supplied metadata for {info_hash} in time")]
    MetadataUnavailable { info_hash: InfoHash },

    #[error("Swarm for {info_hash} is stalled")]
    SwarmStalled { info_hash: InfoHash },

    #[error("Piece {index} is not held by any peer in the swarm")]
    PieceUnobtainable { index: PieceIndex },

    #[error("Session {info_hash} was closed")]
    SessionClosed { info_hash: InfoHash },

    #[error("Torrent engine has shut down")]
    EngineShutdown,

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}
