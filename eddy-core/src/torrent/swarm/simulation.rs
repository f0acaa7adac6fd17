//! In-process swarm for tests and demos.
//!
//! Simulated peers speak the real wire protocol over in-memory duplex pipes,
//! so sessions exercise the same codec, handshake and worker paths they use
//! over TCP. Each peer holds a configurable set of pieces.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::discovery::{DiscoveryRequest, PeerDiscovery, SwarmTransport};
use super::peer::{PeerChannel, PeerConnector, StreamChannel};
use crate::torrent::parsing::{BencodeParser, BencodeValue, MagnetParser, encode_torrent_file};
use crate::torrent::protocol::extension::{EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID};
use crate::torrent::protocol::handshake::HANDSHAKE_LENGTH;
use crate::torrent::protocol::{
    Bitfield, ExtensionHandshake, HandshakeCodec, MessageCodec, MetadataMessage, PeerHandshake,
    PeerId, PeerMessage,
};
use crate::torrent::{InfoHash, PieceIndex, TorrentError, TorrentMetadata};

/// Deterministic pseudo-random payload.
pub fn random_content(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut content = vec![0u8; len];
    rng.fill_bytes(&mut content);
    content
}

/// A torrent built from in-memory content.
#[derive(Debug, Clone)]
pub struct SimulatedTorrent {
    pub metadata: Arc<TorrentMetadata>,
    pub descriptor: Vec<u8>,
    pub content: Bytes,
}

impl SimulatedTorrent {
    /// Single-file torrent holding `content`.
    pub fn single_file(name: &str, content: Vec<u8>, piece_length: u32) -> Self {
        let info = BencodeValue::dictionary()
            .with("name", name)
            .with("length", content.len() as i64);
        Self::build(info, content, piece_length)
    }

    /// Multi-file torrent; file payloads are concatenated in order.
    pub fn multi_file(name: &str, files: Vec<(&str, Vec<u8>)>, piece_length: u32) -> Self {
        let mut content = Vec::new();
        let entries: Vec<BencodeValue> = files
            .into_iter()
            .map(|(path, data)| {
                let entry = BencodeValue::dictionary()
                    .with("length", data.len() as i64)
                    .with("path", vec![BencodeValue::from(path)]);
                content.extend_from_slice(&data);
                entry
            })
            .collect();
        let info = BencodeValue::dictionary()
            .with("name", name)
            .with("files", entries);
        Self::build(info, content, piece_length)
    }

    fn build(info: BencodeValue, content: Vec<u8>, piece_length: u32) -> Self {
        let hashes: Vec<u8> = content
            .chunks(piece_length as usize)
            .flat_map(|piece| Sha1::digest(piece).to_vec())
            .collect();
        let info_bytes = info
            .with("piece length", i64::from(piece_length))
            .with("pieces", hashes)
            .encode();
        let descriptor = encode_torrent_file(&info_bytes, &[]);
        let metadata = BencodeParser::parse_torrent(&descriptor)
            .expect("simulated descriptor is well formed");
        Self {
            metadata: Arc::new(metadata),
            descriptor,
            content: Bytes::from(content),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    /// Magnet URI without trackers; peers come from the simulated swarm.
    pub fn magnet_uri(&self) -> String {
        MagnetParser::to_magnet_uri(self.info_hash(), &self.metadata.name, &[])
    }

    fn piece(&self, index: PieceIndex) -> Option<Bytes> {
        let start = self.metadata.piece_offset(index) as usize;
        let end = start + self.metadata.piece_size(index) as usize;
        (index.as_u32() < self.metadata.piece_count()).then(|| self.content.slice(start..end))
    }
}

/// How a simulated peer behaves.
#[derive(Debug, Clone)]
pub struct PeerBehavior {
    /// Flip the first byte of every served block
    pub corrupt: bool,
    /// Answer `ut_metadata` requests
    pub serves_metadata: bool,
    /// Advertise the extension protocol in the handshake
    pub extensions: bool,
    /// Delay before answering each block request
    pub block_delay: Duration,
    /// Ask the session for every piece it announces
    pub leech: bool,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            corrupt: false,
            serves_metadata: true,
            extensions: true,
            block_delay: Duration::ZERO,
            leech: false,
        }
    }
}

#[derive(Debug, Clone)]
struct SimulatedPeer {
    info_hash: InfoHash,
    pieces: HashSet<u32>,
    behavior: PeerBehavior,
}

#[derive(Debug, Default)]
struct SwarmCounters {
    active_connections: AtomicUsize,
    leeched_bytes: AtomicU64,
}

/// Scripted swarm acting as both peer discovery and peer connector.
#[derive(Default)]
pub struct SimulatedSwarm {
    torrents: Mutex<HashMap<InfoHash, SimulatedTorrent>>,
    peers: Mutex<HashMap<SocketAddr, SimulatedPeer>>,
    next_host: AtomicU32,
    counters: Arc<SwarmCounters>,
}

impl SimulatedSwarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_torrent(&self, torrent: SimulatedTorrent) {
        self.torrents.lock().insert(torrent.info_hash(), torrent);
    }

    /// Adds a peer holding every piece.
    pub fn add_seeder(&self, info_hash: InfoHash) -> SocketAddr {
        let pieces = self.all_pieces(info_hash);
        self.add_peer_with(info_hash, pieces, PeerBehavior::default())
    }

    /// Adds a seeder whose blocks never verify.
    pub fn add_corrupt_seeder(&self, info_hash: InfoHash) -> SocketAddr {
        let pieces = self.all_pieces(info_hash);
        let behavior = PeerBehavior {
            corrupt: true,
            ..PeerBehavior::default()
        };
        self.add_peer_with(info_hash, pieces, behavior)
    }

    /// Adds a peer holding exactly `pieces`.
    pub fn add_peer(&self, info_hash: InfoHash, pieces: impl IntoIterator<Item = u32>) -> SocketAddr {
        self.add_peer_with(info_hash, pieces, PeerBehavior::default())
    }

    pub fn add_peer_with(
        &self,
        info_hash: InfoHash,
        pieces: impl IntoIterator<Item = u32>,
        behavior: PeerBehavior,
    ) -> SocketAddr {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed) + 1;
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + host)), 6881);
        self.peers.lock().insert(
            address,
            SimulatedPeer {
                info_hash,
                pieces: pieces.into_iter().collect(),
                behavior,
            },
        );
        address
    }

    /// Stops announcing a peer; existing connections stay open.
    pub fn remove_peer(&self, address: SocketAddr) {
        self.peers.lock().remove(&address);
    }

    /// Connections currently open to simulated peers.
    pub fn active_connections(&self) -> usize {
        self.counters.active_connections.load(Ordering::Relaxed)
    }

    /// Bytes leeching peers have received from sessions.
    pub fn leeched_bytes(&self) -> u64 {
        self.counters.leeched_bytes.load(Ordering::Relaxed)
    }

    pub fn transport(self: &Arc<Self>) -> SwarmTransport {
        SwarmTransport::new(
            Arc::clone(self) as Arc<dyn PeerConnector>,
            Arc::clone(self) as Arc<dyn PeerDiscovery>,
        )
    }

    fn all_pieces(&self, info_hash: InfoHash) -> Vec<u32> {
        self.torrents
            .lock()
            .get(&info_hash)
            .map(|torrent| (0..torrent.metadata.piece_count()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerDiscovery for SimulatedSwarm {
    async fn discover(&self, request: &DiscoveryRequest) -> Vec<SocketAddr> {
        let mut found: Vec<SocketAddr> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, peer)| peer.info_hash == request.info_hash)
            .map(|(address, _)| *address)
            .collect();
        found.sort();
        found
    }
}

#[async_trait]
impl PeerConnector for SimulatedSwarm {
    async fn connect(
        &self,
        address: SocketAddr,
        handshake: &PeerHandshake,
    ) -> Result<Box<dyn PeerChannel>, TorrentError> {
        let peer = self.peers.lock().get(&address).cloned().ok_or_else(|| {
            TorrentError::PeerConnectionError {
                reason: format!("No simulated peer at {address}"),
            }
        })?;
        let torrent = self
            .torrents
            .lock()
            .get(&peer.info_hash)
            .cloned()
            .ok_or_else(|| TorrentError::PeerConnectionError {
                reason: format!("Simulated peer {address} has no torrent"),
            })?;

        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let counters = Arc::clone(&self.counters);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let served = serve_peer(server, torrent, peer, &counters).await;
            counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            if let Err(e) = served {
                tracing::trace!(peer = %address, error = %e, "Simulated peer finished");
            }
        });

        let remote = HandshakeCodec::exchange(&mut client, handshake).await?;
        Ok(Box::new(StreamChannel::new(client, address, &remote)))
    }
}

async fn serve_peer(
    mut stream: DuplexStream,
    torrent: SimulatedTorrent,
    peer: SimulatedPeer,
    counters: &SwarmCounters,
) -> Result<(), TorrentError> {
    let mut incoming = [0u8; HANDSHAKE_LENGTH];
    stream.read_exact(&mut incoming).await?;
    let theirs = HandshakeCodec::deserialize_handshake(&incoming)?;
    let mut ours = PeerHandshake::new(torrent.info_hash(), PeerId::generate("-SIM001-"));
    if !peer.behavior.extensions {
        ours.reserved = [0; 8];
    }
    stream
        .write_all(&HandshakeCodec::serialize_handshake(&ours))
        .await?;

    let (mut reader, mut writer) = tokio::io::split(stream);
    let behavior = &peer.behavior;

    if ours.supports_extensions() && theirs.supports_extensions() {
        let metadata_size = behavior
            .serves_metadata
            .then_some(torrent.metadata.info_bytes.len() as u64);
        let handshake = ExtensionHandshake::local(metadata_size);
        MessageCodec::write_message(
            &mut writer,
            &PeerMessage::Extended {
                extended_id: EXTENSION_HANDSHAKE_ID,
                payload: handshake.encode(),
            },
        )
        .await?;
    }

    let mut held = Bitfield::new(torrent.metadata.piece_count());
    for piece in &peer.pieces {
        if *piece < held.len() {
            held.set(PieceIndex::new(*piece));
        }
    }
    if !peer.pieces.is_empty() {
        MessageCodec::write_message(
            &mut writer,
            &PeerMessage::Bitfield {
                bitfield: held.to_bytes(),
            },
        )
        .await?;
    }
    if behavior.leech {
        MessageCodec::write_message(&mut writer, &PeerMessage::Interested).await?;
    }

    let mut their_metadata_id = None;
    let mut unchoked_by_them = false;
    let mut to_leech: Vec<PieceIndex> = Vec::new();

    loop {
        let message = MessageCodec::read_message(&mut reader).await?;
        match message {
            PeerMessage::Interested => {
                MessageCodec::write_message(&mut writer, &PeerMessage::Unchoke).await?;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                if !held.has(piece_index) {
                    continue;
                }
                let Some(piece) = torrent.piece(piece_index) else {
                    continue;
                };
                let end = offset as usize + length as usize;
                if end > piece.len() {
                    continue;
                }
                if !behavior.block_delay.is_zero() {
                    tokio::time::sleep(behavior.block_delay).await;
                }
                let mut block = piece.slice(offset as usize..end).to_vec();
                if behavior.corrupt && !block.is_empty() {
                    block[0] ^= 0xff;
                }
                MessageCodec::write_message(
                    &mut writer,
                    &PeerMessage::Piece {
                        piece_index,
                        offset,
                        data: Bytes::from(block),
                    },
                )
                .await?;
            }
            PeerMessage::Extended {
                extended_id: EXTENSION_HANDSHAKE_ID,
                payload,
            } => {
                their_metadata_id = ExtensionHandshake::decode(&payload)?.ut_metadata;
            }
            PeerMessage::Extended {
                extended_id: LOCAL_UT_METADATA_ID,
                payload,
            } => {
                let (Some(reply_id), true) = (their_metadata_id, behavior.serves_metadata) else {
                    continue;
                };
                if let MetadataMessage::Request { piece } = MetadataMessage::decode(&payload)? {
                    let info = &torrent.metadata.info_bytes;
                    let start = piece as usize * 16_384;
                    let end = (start + 16_384).min(info.len());
                    let reply = if start < info.len() {
                        MetadataMessage::Data {
                            piece,
                            total_size: info.len() as u64,
                            data: info.slice(start..end),
                        }
                    } else {
                        MetadataMessage::Reject { piece }
                    };
                    MessageCodec::write_message(
                        &mut writer,
                        &PeerMessage::Extended {
                            extended_id: reply_id,
                            payload: reply.encode(),
                        },
                    )
                    .await?;
                }
            }
            PeerMessage::Unchoke if behavior.leech => {
                unchoked_by_them = true;
            }
            PeerMessage::Have { piece_index } if behavior.leech => to_leech.push(piece_index),
            PeerMessage::Bitfield { bitfield } if behavior.leech => {
                let advertised = Bitfield::from_wire(&bitfield, held.len())?;
                to_leech.extend(advertised.iter_set());
            }
            PeerMessage::Piece { data, .. } if behavior.leech => {
                counters
                    .leeched_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            _ => {}
        }

        if unchoked_by_them {
            for piece_index in to_leech.drain(..) {
                let length = torrent.metadata.piece_size(piece_index).min(16_384);
                MessageCodec::write_message(
                    &mut writer,
                    &PeerMessage::Request {
                        piece_index,
                        offset: 0,
                        length,
                    },
                )
                .await?;
            }
        }
    }
}
