//! Actor implementation for the torrent engine.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use super::commands::{EngineCommand, TorrentSource};
use super::handle::EngineHandle;
use crate::config::EddyConfig;
use crate::torrent::protocol::PeerId;
use crate::torrent::swarm::fetch_metadata;
use crate::torrent::{
    BencodeParser, InfoHash, MagnetParser, SessionSnapshot, SwarmTransport, TorrentError,
    TorrentHandle, TorrentMetadata,
};

type OpenResponder = oneshot::Sender<Result<TorrentHandle, TorrentError>>;

/// Spawns the engine actor and returns its handle.
///
/// The actor processes commands one at a time. Magnet metadata fetches and
/// session closes run off the actor so they never hold up other requests.
pub fn spawn_engine(config: EddyConfig, transport: SwarmTransport) -> EngineHandle {
    let (sender, receiver) = mpsc::channel(100);
    let engine = TorrentEngine {
        config,
        transport,
        sessions: HashMap::new(),
        pending: HashMap::new(),
        fetches: JoinSet::new(),
    };
    tokio::spawn(engine.run(receiver));
    EngineHandle::new(sender)
}

struct TorrentEngine {
    config: EddyConfig,
    transport: SwarmTransport,
    sessions: HashMap<InfoHash, TorrentHandle>,
    /// Callers waiting on a magnet whose metadata is still being fetched
    pending: HashMap<InfoHash, Vec<OpenResponder>>,
    fetches: JoinSet<(InfoHash, Result<TorrentMetadata, TorrentError>)>,
}

impl TorrentEngine {
    async fn run(mut self, mut receiver: mpsc::Receiver<EngineCommand>) {
        tracing::debug!("Torrent engine actor started");

        loop {
            tokio::select! {
                command = receiver.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(fetched) = self.fetches.join_next() => {
                    if let Ok((info_hash, result)) = fetched {
                        self.finish_open(info_hash, result);
                    }
                }
            }
        }

        self.fetches.abort_all();
        self.pending.clear();
        for (_, handle) in self.sessions.drain() {
            if let Err(e) = handle.close(false).await {
                tracing::warn!(info_hash = %handle.info_hash(), error = %e, "Failed to close session");
            }
        }
        tracing::debug!("Torrent engine actor stopped");
    }

    /// Handles one command. Returns false to stop the actor.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Open { source, responder } => self.open(source, responder),

            EngineCommand::Get {
                info_hash,
                responder,
            } => {
                let result = self
                    .sessions
                    .get(&info_hash)
                    .cloned()
                    .ok_or(TorrentError::TorrentNotFound { info_hash });
                let _ = responder.send(result);
            }

            EngineCommand::List { responder } => {
                let _ = responder.send(self.sessions.values().cloned().collect());
            }

            EngineCommand::Snapshot {
                info_hash,
                responder,
            } => {
                let result = match self.sessions.get(&info_hash) {
                    Some(handle) => Ok(handle.snapshot()),
                    None if self.pending.contains_key(&info_hash) => {
                        Ok(SessionSnapshot::fetching_metadata())
                    }
                    None => Err(TorrentError::TorrentNotFound { info_hash }),
                };
                let _ = responder.send(result);
            }

            EngineCommand::Close {
                info_hash,
                delete_data,
                responder,
            } => {
                let Some(handle) = self.sessions.remove(&info_hash) else {
                    let _ = responder.send(Err(TorrentError::TorrentNotFound { info_hash }));
                    return true;
                };
                // Data deletion can be slow; the reply comes from the task.
                tokio::spawn(async move {
                    let _ = responder.send(handle.close(delete_data).await);
                });
            }

            EngineCommand::Shutdown { responder } => {
                tracing::debug!("Torrent engine actor shutting down");
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    fn open(&mut self, source: TorrentSource, responder: OpenResponder) {
        match source {
            TorrentSource::Descriptor(bytes) => {
                let result = BencodeParser::parse_torrent(&bytes).map(|metadata| self.start(metadata));
                let _ = responder.send(result);
            }
            TorrentSource::Magnet(uri) => {
                let magnet = match MagnetParser::parse_magnet_link(&uri) {
                    Ok(magnet) => magnet,
                    Err(e) => {
                        let _ = responder.send(Err(e));
                        return;
                    }
                };
                let info_hash = magnet.info_hash;
                if let Some(handle) = self.sessions.get(&info_hash) {
                    let _ = responder.send(Ok(handle.clone()));
                    return;
                }
                if let Some(waiters) = self.pending.get_mut(&info_hash) {
                    waiters.push(responder);
                    return;
                }

                tracing::info!(info_hash = %info_hash, "Fetching magnet metadata");
                self.pending.insert(info_hash, vec![responder]);
                let transport = self.transport.clone();
                let config = self.config.clone();
                let peer_id = PeerId::generate(config.torrent.client_id);
                self.fetches.spawn(async move {
                    let result = fetch_metadata(&magnet, &transport, peer_id, &config).await;
                    (info_hash, result)
                });
            }
        }
    }

    fn finish_open(&mut self, info_hash: InfoHash, result: Result<TorrentMetadata, TorrentError>) {
        let waiters = self.pending.remove(&info_hash).unwrap_or_default();
        match result {
            Ok(metadata) => {
                let handle = self.start(metadata);
                for waiter in waiters {
                    let _ = waiter.send(Ok(handle.clone()));
                }
            }
            Err(e) => {
                tracing::warn!(info_hash = %info_hash, error = %e, "Magnet metadata fetch failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(TorrentError::MetadataUnavailable { info_hash }));
                }
            }
        }
    }

    /// Returns the running session for `metadata`, starting one if needed.
    fn start(&mut self, metadata: TorrentMetadata) -> TorrentHandle {
        if let Some(handle) = self.sessions.get(&metadata.info_hash) {
            return handle.clone();
        }
        let handle = TorrentHandle::spawn(metadata, &self.config, self.transport.clone());
        self.sessions.insert(handle.info_hash(), handle.clone());
        handle
    }
}
