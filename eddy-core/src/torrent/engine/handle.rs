//! Handle for communicating with the torrent engine actor.

use tokio::sync::{mpsc, oneshot};

use super::commands::{EngineCommand, TorrentSource};
use crate::torrent::{InfoHash, SessionSnapshot, TorrentError, TorrentHandle};

/// Cloneable async API over the engine actor.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(sender: mpsc::Sender<EngineCommand>) -> Self {
        Self { sender }
    }

    /// Opens a torrent and starts downloading it.
    ///
    /// Opening a torrent that is already running returns the existing
    /// session. Concurrent opens of the same magnet share one metadata fetch.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed descriptor or magnet URI
    /// - `TorrentError::MetadataUnavailable` - No peer delivered magnet metadata in time
    /// - `TorrentError::EngineShutdown` - The engine has stopped
    pub async fn open(&self, source: TorrentSource) -> Result<TorrentHandle, TorrentError> {
        self.request(|responder| EngineCommand::Open { source, responder })
            .await?
    }

    /// Looks up a running session.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - No running session for the hash
    /// - `TorrentError::EngineShutdown` - The engine has stopped
    pub async fn get(&self, info_hash: InfoHash) -> Result<TorrentHandle, TorrentError> {
        self.request(|responder| EngineCommand::Get {
            info_hash,
            responder,
        })
        .await?
    }

    /// All running sessions, in no particular order.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - The engine has stopped
    pub async fn list(&self) -> Result<Vec<TorrentHandle>, TorrentError> {
        self.request(|responder| EngineCommand::List { responder })
            .await
    }

    /// Snapshot of a session, or a `fetching_metadata` placeholder while a
    /// magnet is being resolved.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Hash neither running nor pending
    /// - `TorrentError::EngineShutdown` - The engine has stopped
    pub async fn snapshot(&self, info_hash: InfoHash) -> Result<SessionSnapshot, TorrentError> {
        self.request(|responder| EngineCommand::Snapshot {
            info_hash,
            responder,
        })
        .await?
    }

    /// Closes a session and removes it from the engine.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - No running session for the hash
    /// - `TorrentError::Storage` - Data deletion failed
    /// - `TorrentError::EngineShutdown` - The engine has stopped
    pub async fn close(&self, info_hash: InfoHash, delete_data: bool) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Close {
            info_hash,
            delete_data,
            responder,
        })
        .await?
    }

    /// Closes every session and stops the actor.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - The engine had already stopped
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Shutdown { responder })
            .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(command(responder))
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }
}
