//! Session coordinator: discovery rounds, peer task supervision, priority
//! commands and health tracking.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use super::discovery::{DiscoveryRequest, SwarmTransport};
use super::stats::RateTracker;
use super::worker::PeerWorker;
use super::{SessionCommand, SessionShared, SessionState};
use crate::torrent::TorrentError;
use crate::torrent::protocol::PeerHandshake;

const RATE_TICK: Duration = Duration::from_secs(1);

pub(crate) async fn run_session(
    shared: Arc<SessionShared>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    transport: SwarmTransport,
) {
    let info_hash = shared.info_hash;
    let mut workers: JoinSet<(SocketAddr, Result<(), TorrentError>)> = JoinSet::new();
    let mut rounds: JoinSet<Vec<SocketAddr>> = JoinSet::new();
    let mut connected: HashSet<SocketAddr> = HashSet::new();
    let mut retry_after: HashMap<SocketAddr, Instant> = HashMap::new();

    let mut discovery_tick = tokio::time::interval(shared.network_config.discovery_interval);
    discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rate_tick = tokio::time::interval(RATE_TICK.min(shared.network_config.discovery_interval * 4));
    rate_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rates = RateTracker::new();

    if shared.store.is_finished() {
        shared.set_state(SessionState::Complete);
    }

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            Some(command) = commands.recv() => apply_command(&shared, command),
            _ = discovery_tick.tick(), if rounds.is_empty() && !shared.store.is_finished() => {
                let request = discovery_request(&shared);
                let discovery = Arc::clone(&transport.discovery);
                rounds.spawn(async move { discovery.discover(&request).await });
            }
            Some(found) = rounds.join_next() => {
                let Ok(found) = found else { continue };
                let now = Instant::now();
                for address in found {
                    if connected.len() >= shared.network_config.max_peer_connections {
                        break;
                    }
                    if connected.contains(&address)
                        || retry_after.get(&address).is_some_and(|at| *at > now)
                    {
                        continue;
                    }
                    connected.insert(address);
                    workers.spawn(connect_and_run(Arc::clone(&shared), transport.clone(), address));
                }
            }
            Some(joined) = workers.join_next() => {
                let Ok((address, result)) = joined else { continue };
                connected.remove(&address);
                retry_after.insert(address, Instant::now() + shared.network_config.peer_retry_delay);
                if let Err(e) = result {
                    tracing::debug!(info_hash = %info_hash, peer = %address, error = %e, "Peer disconnected");
                }
            }
            _ = rate_tick.tick() => {
                rates.tick(&shared.stats, std::time::Instant::now());
                update_health(&shared);
            }
        }
    }

    // Any remaining commands are moot once closed.
    commands.close();
    rounds.abort_all();
    workers.shutdown().await;
    shared.set_state(SessionState::Closed);
    tracing::debug!(info_hash = %info_hash, "Swarm session stopped");
}

fn apply_command(shared: &SessionShared, command: SessionCommand) {
    match command {
        SessionCommand::SetPriority { pieces, level } => {
            shared.picker.lock().set_priority(pieces, level);
        }
    }
}

fn discovery_request(shared: &SessionShared) -> DiscoveryRequest {
    let metadata = &shared.metadata;
    let have = u64::from(shared.store.completed_count()) * u64::from(metadata.piece_length);
    DiscoveryRequest {
        info_hash: shared.info_hash,
        peer_id: shared.peer_id,
        port: shared.torrent_config.listen_port,
        uploaded: shared.stats.uploaded.load(Ordering::Relaxed),
        downloaded: shared.stats.downloaded.load(Ordering::Relaxed),
        left: metadata.total_length.saturating_sub(have),
        trackers: metadata.announce_urls.clone(),
    }
}

async fn connect_and_run(
    shared: Arc<SessionShared>,
    transport: SwarmTransport,
    address: SocketAddr,
) -> (SocketAddr, Result<(), TorrentError>) {
    let handshake = PeerHandshake::new(shared.info_hash, shared.peer_id);
    let channel = tokio::select! {
        _ = shared.cancel.cancelled() => return (address, Ok(())),
        connected = transport.connector.connect(address, &handshake) => connected,
    };
    let result = match channel {
        Ok(channel) => {
            tracing::trace!(info_hash = %shared.info_hash, peer = %address, "Peer connected");
            PeerWorker::new(shared, channel).run().await
        }
        Err(e) => Err(e),
    };
    (address, result)
}

/// Derives `Complete`, `Stalled` and `Downloading` from current counters.
fn update_health(shared: &SessionShared) {
    let next = if shared.store.is_finished() {
        SessionState::Complete
    } else if shared.stats.connected_peers.load(Ordering::Relaxed) == 0
        && shared.since_progress() >= shared.torrent_config.stall_timeout
    {
        SessionState::Stalled
    } else {
        SessionState::Downloading
    };

    let previous = shared.set_state(next);
    if previous == next || previous == SessionState::Closed {
        return;
    }
    match next {
        SessionState::Complete => {
            tracing::info!(info_hash = %shared.info_hash, "Download complete");
        }
        SessionState::Stalled => {
            tracing::warn!(
                info_hash = %shared.info_hash,
                error = %TorrentError::SwarmStalled { info_hash: shared.info_hash },
                "No peers and no progress"
            );
        }
        _ => {
            tracing::info!(info_hash = %shared.info_hash, state = %next, "Session state changed");
        }
    }
}
