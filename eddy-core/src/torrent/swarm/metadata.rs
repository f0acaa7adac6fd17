//! Magnet metadata resolution over the `ut_metadata` extension.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;

use super::discovery::{DiscoveryRequest, SwarmTransport};
use super::peer::PeerChannel;
use crate::config::EddyConfig;
use crate::torrent::parsing::{BencodeParser, MagnetLink, TorrentMetadata};
use crate::torrent::protocol::extension::{
    EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, MAX_METADATA_SIZE, METADATA_BLOCK_SIZE,
    metadata_block_count,
};
use crate::torrent::TorrentError;
use crate::torrent::protocol::{
    ExtensionHandshake, MetadataMessage, PeerHandshake, PeerId, PeerMessage,
};

/// Fetches and verifies the info dictionary a magnet link refers to.
///
/// Peers are tried one at a time; a peer that refuses, disconnects or hands
/// out metadata whose hash does not match is skipped.
///
/// # Errors
/// - `TorrentError::MetadataUnavailable` - No peer delivered valid metadata
///   within the metadata timeout
pub(crate) async fn fetch_metadata(
    magnet: &MagnetLink,
    transport: &SwarmTransport,
    peer_id: PeerId,
    config: &EddyConfig,
) -> Result<TorrentMetadata, TorrentError> {
    let info_hash = magnet.info_hash;
    let attempt = async {
        let request = DiscoveryRequest {
            info_hash,
            peer_id,
            port: config.torrent.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            trackers: magnet.trackers.clone(),
        };
        let mut tried: HashSet<SocketAddr> = HashSet::new();

        loop {
            let candidates = transport.discovery.discover(&request).await;
            for address in candidates {
                if !tried.insert(address) {
                    continue;
                }
                match metadata_from_peer(address, magnet, transport, peer_id, config).await {
                    Ok(metadata) => return metadata,
                    Err(e) => {
                        tracing::debug!(
                            info_hash = %info_hash,
                            peer = %address,
                            error = %e,
                            "Peer could not supply metadata"
                        );
                    }
                }
            }
            // Failed peers get another chance on the next round.
            tokio::time::sleep(config.network.discovery_interval).await;
            tried.clear();
        }
    };

    match tokio::time::timeout(config.torrent.metadata_timeout, attempt).await {
        Ok(metadata) => {
            tracing::info!(info_hash = %info_hash, name = %metadata.name, "Resolved magnet metadata");
            Ok(metadata)
        }
        Err(_) => {
            tracing::warn!(info_hash = %info_hash, "Metadata resolution timed out");
            Err(TorrentError::MetadataUnavailable { info_hash })
        }
    }
}

async fn metadata_from_peer(
    address: SocketAddr,
    magnet: &MagnetLink,
    transport: &SwarmTransport,
    peer_id: PeerId,
    config: &EddyConfig,
) -> Result<TorrentMetadata, TorrentError> {
    let handshake = PeerHandshake::new(magnet.info_hash, peer_id);
    let mut channel = transport.connector.connect(address, &handshake).await?;
    if !channel.supports_extensions() {
        return Err(protocol_error("Peer does not support the extension protocol"));
    }

    channel
        .send(PeerMessage::Extended {
            extended_id: EXTENSION_HANDSHAKE_ID,
            payload: ExtensionHandshake::local(None).encode(),
        })
        .await?;

    let patience = config.network.peer_connect_timeout.max(Duration::from_secs(1));
    let remote = loop {
        if let PeerMessage::Extended {
            extended_id: EXTENSION_HANDSHAKE_ID,
            payload,
        } = recv_within(channel.as_mut(), patience).await?
        {
            break ExtensionHandshake::decode(&payload)?;
        }
    };

    let (Some(remote_id), Some(size)) = (remote.ut_metadata, remote.metadata_size) else {
        return Err(protocol_error("Peer does not offer metadata"));
    };
    if size == 0 || size > MAX_METADATA_SIZE {
        return Err(protocol_error(&format!("Implausible metadata size {size}")));
    }

    let blocks = metadata_block_count(size);
    let mut assembled = BytesMut::zeroed(size as usize);
    let mut received = vec![false; blocks as usize];

    for piece in 0..blocks {
        channel
            .send(PeerMessage::Extended {
                extended_id: remote_id,
                payload: MetadataMessage::Request { piece }.encode(),
            })
            .await?;
    }

    while received.iter().any(|done| !done) {
        let PeerMessage::Extended {
            extended_id: LOCAL_UT_METADATA_ID,
            payload,
        } = recv_within(channel.as_mut(), patience).await?
        else {
            continue;
        };
        match MetadataMessage::decode(&payload)? {
            MetadataMessage::Data { piece, data, .. } if piece < blocks => {
                let start = piece as usize * METADATA_BLOCK_SIZE;
                let expected = (size as usize - start).min(METADATA_BLOCK_SIZE);
                if data.len() != expected {
                    return Err(protocol_error("Metadata block has the wrong length"));
                }
                assembled[start..start + expected].copy_from_slice(&data);
                received[piece as usize] = true;
            }
            MetadataMessage::Reject { piece } => {
                return Err(protocol_error(&format!("Peer rejected metadata block {piece}")));
            }
            _ => {}
        }
    }

    if BencodeParser::info_hash(&assembled) != magnet.info_hash {
        return Err(protocol_error("Metadata does not match the info hash"));
    }
    BencodeParser::parse_info_dictionary(&assembled, magnet.trackers.clone())
}

async fn recv_within(
    channel: &mut dyn PeerChannel,
    patience: Duration,
) -> Result<PeerMessage, TorrentError> {
    let address = channel.address();
    tokio::time::timeout(patience, channel.recv())
        .await
        .map_err(|_| TorrentError::PeerConnectionError {
            reason: format!("{address} went silent during metadata exchange"),
        })?
}

fn protocol_error(message: &str) -> TorrentError {
    TorrentError::ProtocolError {
        message: message.to_string(),
    }
}
