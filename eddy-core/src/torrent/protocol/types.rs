//! Core types for the BitTorrent wire protocol

use bytes::Bytes;
use rand::Rng;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol string sent in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID behind the given 8-byte client prefix.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = client_prefix.as_bytes();
        let prefix_len = prefix.len().min(8);
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        rand::rng().fill(&mut id[prefix_len..]);
        Self(id)
    }
}

/// BitTorrent wire protocol messages.
///
/// BEP 3 message set plus the BEP 10 extended message envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Inform peer that we are choking them
    Choke,
    /// Inform peer that we are no longer choking them
    Unchoke,
    /// Inform peer that we are interested in their pieces
    Interested,
    /// Inform peer that we are not interested in their pieces
    NotInterested,
    /// Inform peer that we have acquired a specific piece
    Have { piece_index: PieceIndex },
    /// Complete piece availability bitmap, most significant bit first
    Bitfield { bitfield: Bytes },
    /// Request a block of data from a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// A block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT port announcement, parsed and ignored
    Port { port: u16 },
    /// Extension protocol message; id 0 is the extension handshake
    Extended { extended_id: u8, payload: Bytes },
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Reserved bit advertising BEP 10 extension protocol support.
    const EXTENSION_BIT: (usize, u8) = (5, 0x10);

    /// Create handshake advertising the extension protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[Self::EXTENSION_BIT.0] |= Self::EXTENSION_BIT.1;
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender supports BEP 10 extended messages.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[Self::EXTENSION_BIT.0] & Self::EXTENSION_BIT.1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_prefix() {
        let id = PeerId::generate("-ED0001-");
        assert_eq!(&id.as_bytes()[..8], b"-ED0001-");
        assert_ne!(id, PeerId::generate("-ED0001-"));
    }

    #[test]
    fn test_handshake_advertises_extensions() {
        let handshake = PeerHandshake::new(InfoHash::new([1; 20]), PeerId::new([2; 20]));
        assert!(handshake.supports_extensions());

        let mut plain = handshake.clone();
        plain.reserved = [0; 8];
        assert!(!plain.supports_extensions());
    }
}
