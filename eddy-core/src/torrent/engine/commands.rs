//! Command definitions for the torrent engine actor.

use tokio::sync::oneshot;

use crate::torrent::{InfoHash, SessionSnapshot, TorrentError, TorrentHandle};

/// Where a torrent's metadata comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    /// Raw bencoded torrent descriptor
    Descriptor(Vec<u8>),
    /// Magnet URI; metadata is fetched from peers
    Magnet(String),
}

impl TorrentSource {
    /// Interprets user input: magnet URIs as-is, anything else as descriptor bytes.
    pub fn from_magnet_or_bytes(input: impl Into<Vec<u8>>) -> Self {
        let input = input.into();
        match std::str::from_utf8(&input) {
            Ok(text) if text.trim_start().starts_with("magnet:") => {
                Self::Magnet(text.trim().to_string())
            }
            _ => Self::Descriptor(input),
        }
    }
}

/// Commands processed sequentially by the engine actor.
///
/// Each request carries a oneshot responder; the actor owns the session map
/// so no locks are shared with callers.
pub(crate) enum EngineCommand {
    /// Open a torrent, reusing a running or pending session for the same hash.
    Open {
        source: TorrentSource,
        responder: oneshot::Sender<Result<TorrentHandle, TorrentError>>,
    },
    /// Look up a running session.
    Get {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<TorrentHandle, TorrentError>>,
    },
    /// All running sessions.
    List {
        responder: oneshot::Sender<Vec<TorrentHandle>>,
    },
    /// Snapshot of a running or pending session.
    Snapshot {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<SessionSnapshot, TorrentError>>,
    },
    /// Close and forget a session.
    Close {
        info_hash: InfoHash,
        delete_data: bool,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Close every session and stop the actor.
    Shutdown { responder: oneshot::Sender<()> },
}
